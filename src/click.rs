//! 应用标识与安装状态查询
//!
//! 通知的目标应用以 click 应用 ID 标识，格式为 `package_app[_version]`。
//! 这里负责解析应用 ID，并通过 `AppRegistry` 查询应用是否已安装、是否被拉黑。

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::LazyLock;
use tracing::debug;

static APP_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z0-9][a-z0-9+.-]+)_([a-zA-Z0-9+.-]+)(?:_([0-9][a-zA-Z0-9.+:~-]*|current-user-version))?$")
        .expect("app id pattern is valid")
});

/// 通知目标应用的 ID（不做校验，解析见 [`ClickApp::parse`]）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppId(String);

impl AppId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 包名部分
    pub fn package(&self) -> Result<String, AppIdError> {
        ClickApp::parse(self).map(|app| app.package)
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AppId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for AppId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// 应用 ID 解析错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid application id: {0}")]
pub struct AppIdError(pub String);

/// 解析后的 click 应用 ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClickApp {
    pub package: String,
    pub application: String,
    pub version: Option<String>,
}

impl ClickApp {
    pub fn parse(id: &AppId) -> Result<Self, AppIdError> {
        let caps = APP_ID_RE
            .captures(id.as_str())
            .ok_or_else(|| AppIdError(id.to_string()))?;

        Ok(Self {
            package: caps[1].to_string(),
            application: caps[2].to_string(),
            version: caps.get(3).map(|m| m.as_str().to_string()),
        })
    }

    /// 对应 `.desktop` 文件名的前缀（不含版本）
    fn desktop_prefix(&self) -> String {
        format!("{}_{}_", self.package, self.application)
    }
}

/// 应用安装状态查询
pub trait AppRegistry: Send + Sync {
    /// 目标应用是否已安装
    fn is_installed(&self, app_id: &AppId) -> bool;

    /// 目标应用是否被拉黑（拉黑的应用不轮询）
    fn is_blacklisted(&self, app_id: &AppId) -> bool;
}

/// 基于 `.desktop` 文件的 click 应用注册表
pub struct ClickRegistry {
    /// 应用 `.desktop` 文件目录
    applications_dir: PathBuf,
    /// 被拉黑的包名
    blacklist: HashSet<String>,
}

impl ClickRegistry {
    pub fn new(applications_dir: impl Into<PathBuf>) -> Self {
        Self {
            applications_dir: applications_dir.into(),
            blacklist: HashSet::new(),
        }
    }

    /// 用户默认的 `~/.local/share/applications`
    pub fn for_user() -> Self {
        let dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("applications");
        Self::new(dir)
    }

    /// 设置黑名单（包名列表）
    pub fn with_blacklist<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blacklist = packages.into_iter().map(Into::into).collect();
        self
    }
}

impl AppRegistry for ClickRegistry {
    fn is_installed(&self, app_id: &AppId) -> bool {
        let app = match ClickApp::parse(app_id) {
            Ok(app) => app,
            Err(e) => {
                debug!(app_id = %app_id, error = %e, "Could not parse APP_ID");
                return false;
            }
        };

        if let Some(version) = &app.version {
            let file = format!("{}{}.desktop", app.desktop_prefix(), version);
            return self.applications_dir.join(file).exists();
        }

        let prefix = app.desktop_prefix();
        match fs::read_dir(&self.applications_dir) {
            Ok(entries) => entries.filter_map(|e| e.ok()).any(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy();
                name.starts_with(&prefix) && name.ends_with(".desktop")
            }),
            Err(e) => {
                debug!(dir = %self.applications_dir.display(), error = %e, "Cannot read applications dir");
                false
            }
        }
    }

    fn is_blacklisted(&self, app_id: &AppId) -> bool {
        match ClickApp::parse(app_id) {
            Ok(app) => self.blacklist.contains(&app.package),
            Err(_) => false,
        }
    }
}
