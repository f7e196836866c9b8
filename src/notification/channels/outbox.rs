//! 本地发件箱后端 - 将所有通知写入 JSONL 文件

use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::click::AppId;
use crate::errors::PostalError;
use crate::notification::backend::NotificationBackend;
use crate::notification::store::{OutboxRecord, OutboxStore};

/// 发件箱后端
///
/// 带卡片的记录视为仍在显示；卡片被抑制的记录只触发提醒，不计入
/// `list_persistent`。
pub struct OutboxBackend {
    store: Arc<OutboxStore>,
}

impl OutboxBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: Arc::new(OutboxStore::new(path)),
        }
    }

    pub fn store(&self) -> &OutboxStore {
        &self.store
    }
}

#[async_trait]
impl NotificationBackend for OutboxBackend {
    fn name(&self) -> &str {
        "outbox"
    }

    async fn list_persistent(&self, app_id: &AppId) -> Result<Vec<String>, PostalError> {
        let store = Arc::clone(&self.store);
        let app_id = app_id.to_string();

        let tags = tokio::task::spawn_blocking(move || {
            store
                .records_for(&app_id)
                .into_iter()
                .filter(|r| r.has_card)
                .map(|r| r.tag)
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| PostalError::Backend(e.to_string()))?;

        Ok(tags)
    }

    async fn post(&self, app_id: &AppId, message: &str) -> Result<(), PostalError> {
        let value: serde_json::Value = serde_json::from_str(message)?;
        let notification = &value["notification"];
        let record = OutboxRecord {
            ts: Utc::now(),
            app_id: app_id.to_string(),
            tag: notification["tag"].as_str().unwrap_or_default().to_string(),
            has_card: notification.get("card").is_some(),
            message: value.clone(),
        };

        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.append(&record))
            .await
            .map_err(|e| PostalError::Backend(e.to_string()))?
            .map_err(|e| PostalError::Backend(e.to_string()))?;

        debug!(backend = "outbox", app_id = %app_id, "Notification recorded to outbox");
        Ok(())
    }
}
