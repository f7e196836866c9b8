//! 外部 helper 程序执行
//!
//! - `pool` - 有界并发的 HelperPool（同一应用不并行、超时强制停止）
//! - `launcher` - 基于 tokio::process 的启动器
//! - `pollers` - 扫描 poller 描述文件

mod backlog;
pub mod launcher;
pub mod pollers;
pub mod pool;

pub use launcher::ProcessLauncher;
pub use pollers::{list_pollers, PollerInfo};
pub use pool::{HelperPool, HelperPoolConfig};

use std::path::Path;

use crate::click::AppId;
use crate::errors::HelperError;
use crate::plugins::PushMessage;

/// 提交给 HelperPool 的一次执行请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperInput {
    pub app_id: AppId,
    pub exec: String,
}

impl HelperInput {
    pub fn new(app_id: impl Into<AppId>, exec: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            exec: exec.into(),
        }
    }
}

/// helper 失败原因
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HelperFailure {
    #[error("can't find helper")]
    CantFindHelper,

    #[error("can't find launcher for helper: {0}")]
    CantFindLauncher(String),

    #[error("could not determine package for app: {0}")]
    InvalidAppId(String),

    #[error("unable to create output tempfile: {0}")]
    TempFile(String),

    #[error("unable to launch helper: {0}")]
    Launch(String),

    /// 超过最长运行时间被强制停止
    #[error("helper was stopped after exceeding its runtime")]
    ForcedStop,

    #[error("unable to read helper output: {0}")]
    Read(String),

    #[error("failed to parse helper output: {0}")]
    Parse(String),

    /// 池停止时仍未完成
    #[error("helper pool stopped before the helper finished")]
    PoolStopped,
}

impl From<&HelperError> for HelperFailure {
    fn from(err: &HelperError) -> Self {
        match err {
            HelperError::CantFindHelper => HelperFailure::CantFindHelper,
            HelperError::CantFindLauncher(s) => HelperFailure::CantFindLauncher(s.clone()),
            HelperError::InvalidAppId(s) => HelperFailure::InvalidAppId(s.clone()),
            HelperError::TempFile(e) => HelperFailure::TempFile(e.to_string()),
            HelperError::NotRunning => HelperFailure::PoolStopped,
            other => HelperFailure::Launch(other.to_string()),
        }
    }
}

/// 一次 helper 执行的结果（每个输入恰好一个）
#[derive(Debug, Clone)]
pub struct HelperResult {
    pub app_id: AppId,
    pub messages: Vec<PushMessage>,
    pub failure: Option<HelperFailure>,
}

impl HelperResult {
    pub fn success(app_id: AppId, messages: Vec<PushMessage>) -> Self {
        Self {
            app_id,
            messages,
            failure: None,
        }
    }

    pub fn failed(app_id: AppId, failure: HelperFailure) -> Self {
        Self {
            app_id,
            messages: Vec::new(),
            failure: Some(failure),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// 完成回调，参数为实例 ID
pub type HelperObserver = Box<dyn Fn(String) + Send + Sync>;

/// 外部 helper 启动器
///
/// 每个成功启动的实例结束时，观察者恰好被调用一次。
/// 观察者不能在 `launch` 或 `stop` 内部同步调用。
pub trait HelperLauncher: Send + Sync {
    fn install_observer(&self, observer: HelperObserver) -> Result<(), HelperError>;

    fn remove_observer(&self) -> Result<(), HelperError>;

    /// 启动 helper，输出写入 `output`，返回实例 ID
    fn launch(&self, app_id: &AppId, exec: &str, output: &Path) -> Result<String, HelperError>;

    /// 请求停止实例（协作式，结束仍通过观察者通知）
    fn stop(&self, app_id: &AppId, instance_id: &str) -> Result<(), HelperError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_failure_from_error() {
        assert_eq!(
            HelperFailure::from(&HelperError::CantFindLauncher("x".into())),
            HelperFailure::CantFindLauncher("x".into())
        );
        let io_err = HelperError::TempFile(io::Error::new(io::ErrorKind::Other, "disk full"));
        assert!(matches!(HelperFailure::from(&io_err), HelperFailure::TempFile(m) if m.contains("disk full")));
        assert!(matches!(
            HelperFailure::from(&HelperError::Launch("boom".into())),
            HelperFailure::Launch(_)
        ));
    }

    #[test]
    fn test_result_success_flag() {
        let app = AppId::new("com.example.feed_feed");
        assert!(HelperResult::success(app.clone(), Vec::new()).is_success());
        assert!(!HelperResult::failed(app, HelperFailure::ForcedStop).is_success());
    }
}
