//! poller 描述文件扫描
//!
//! 每个 poller 是一个 JSON 文件 `{"app_id": .., "exec": ..}`，`exec` 相对于
//! 描述文件（解析符号链接后）所在目录。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::click::AppId;

/// 一个已发现的 poller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollerInfo {
    pub app_id: AppId,
    pub exec: String,
}

/// 递归扫描目录，无效的描述文件记录日志后跳过
pub fn list_pollers(dir: &Path) -> Vec<PollerInfo> {
    let mut files = Vec::new();
    collect_files(dir, &mut files);
    files.sort();

    files.iter().filter_map(|path| load_poller(path)).collect()
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "Cannot read pollers directory");
            return;
        }
    };

    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        match entry.file_type() {
            Ok(ft) if ft.is_dir() => collect_files(&path, out),
            Ok(_) => out.push(path),
            Err(e) => debug!(path = %path.display(), error = %e, "Cannot stat poller entry"),
        }
    }
}

fn load_poller(path: &Path) -> Option<PollerInfo> {
    let data = match fs::read(path) {
        Ok(d) => d,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unable to read poller info file");
            return None;
        }
    };

    let mut poller: PollerInfo = match serde_json::from_slice(&data) {
        Ok(p) => p,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unable to load poller info file");
            return None;
        }
    };

    let base = match fs::canonicalize(path) {
        Ok(abs) => abs.parent().map(Path::to_path_buf).unwrap_or_default(),
        Err(e) => {
            warn!(app_id = %poller.app_id, error = %e, "Unable to determine application base path");
            return None;
        }
    };
    poller.exec = base.join(&poller.exec).to_string_lossy().into_owned();

    Some(poller)
}
