//! Dry-run 后端 - 只打日志不投递

use async_trait::async_trait;
use tracing::info;

use crate::click::AppId;
use crate::errors::PostalError;
use crate::notification::backend::NotificationBackend;

#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunBackend;

#[async_trait]
impl NotificationBackend for DryRunBackend {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn list_persistent(&self, _app_id: &AppId) -> Result<Vec<String>, PostalError> {
        Ok(Vec::new())
    }

    async fn post(&self, app_id: &AppId, message: &str) -> Result<(), PostalError> {
        info!(backend = "dry-run", app_id = %app_id, message = %message, "Would post notification");
        Ok(())
    }
}
