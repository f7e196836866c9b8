//! 通知发件箱存储 - 本地 JSONL 文件读写

use anyhow::Result;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// 已投递的通知记录（JSONL 格式）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// ISO8601 时间戳
    pub ts: DateTime<Utc>,
    /// 目标应用
    pub app_id: String,
    /// 通知 tag
    #[serde(default)]
    pub tag: String,
    /// 是否带可见卡片
    #[serde(default)]
    pub has_card: bool,
    /// 原始推送消息
    pub message: serde_json::Value,
}

const MAX_RECORDS: usize = 500;
const KEEP_AFTER_CLEANUP: usize = 250;
const CLEANUP_CHECK_INTERVAL: usize = 10;

/// JSONL 发件箱
#[derive(Debug)]
pub struct OutboxStore {
    path: PathBuf,
    write_count: AtomicUsize,
}

impl OutboxStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_count: AtomicUsize::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 追加记录（带文件锁）
    pub fn append(&self, record: &OutboxRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.lock_exclusive()?;
        writeln!(file, "{}", serde_json::to_string(record)?)?;
        file.unlock()?;

        self.maybe_cleanup();
        Ok(())
    }

    /// 读取全部记录，损坏的行跳过
    pub fn read_all(&self) -> Vec<OutboxRecord> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };

        BufReader::new(file)
            .lines()
            .filter_map(|line| line.ok())
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect()
    }

    /// 某应用的全部记录
    pub fn records_for(&self, app_id: &str) -> Vec<OutboxRecord> {
        self.read_all()
            .into_iter()
            .filter(|r| r.app_id == app_id)
            .collect()
    }

    /// 删除某应用的全部记录（相当于用户清空了通知）
    pub fn clear_app(&self, app_id: &str) -> Result<()> {
        let keep: Vec<OutboxRecord> = self
            .read_all()
            .into_iter()
            .filter(|r| r.app_id != app_id)
            .collect();
        self.rewrite(&keep)
    }

    /// 定期检查并清理
    fn maybe_cleanup(&self) {
        let count = self.write_count.fetch_add(1, Ordering::Relaxed);
        if count % CLEANUP_CHECK_INTERVAL != 0 {
            return;
        }

        let records = self.read_all();
        if records.len() > MAX_RECORDS {
            let start = records.len().saturating_sub(KEEP_AFTER_CLEANUP);
            let _ = self.rewrite(&records[start..]);
        }
    }

    /// 写临时文件后原子替换
    fn rewrite(&self, records: &[OutboxRecord]) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }

        let file = File::open(&self.path)?;
        file.lock_exclusive()?;

        let temp_path = self.path.with_extension("tmp");
        {
            let mut temp_file = File::create(&temp_path)?;
            for record in records {
                writeln!(temp_file, "{}", serde_json::to_string(record)?)?;
            }
        }
        fs::rename(&temp_path, &self.path)?;

        file.unlock()?;
        Ok(())
    }
}
