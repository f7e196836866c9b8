//! 错误类型定义
//!
//! 每个子系统一个错误枚举。轮询、helper、通知投递的失败都以这些类型
//! 向上传递，预期内的失败路径不会 panic。

use std::io;

/// 插件轮询服务时返回的错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PluginError {
    /// 访问令牌过期，需要凭据刷新
    #[error("authentication token has expired")]
    TokenExpired,

    #[error("request failed: {0}")]
    Http(String),

    #[error("unable to parse service response: {0}")]
    Parse(String),

    #[error("{0}")]
    Other(String),
}

/// AccountManager 单次轮询的失败原因
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    /// 目标应用未安装（不计入惩罚）
    #[error("target application is not installed")]
    NotInstalled,

    /// 目标应用在黑名单中（不计入惩罚）
    #[error("target application is blacklisted")]
    Blacklisted,

    /// 认证数据带有错误，等待新的凭据（不计入惩罚）
    #[error("account failed to authenticate: {0}")]
    AuthPending(String),

    /// 令牌过期，已请求刷新
    #[error("authentication token has expired")]
    TokenExpired,

    #[error("plugin error: {0}")]
    Plugin(PluginError),

    /// 轮询任务异常结束（panic 或被取消）
    #[error("poll task failed: {0}")]
    TaskFailed(String),
}

impl PollError {
    /// 是否计入惩罚计数
    pub fn counts_as_penalty(&self) -> bool {
        matches!(self, PollError::Plugin(_) | PollError::TaskFailed(_))
    }
}

impl From<PluginError> for PollError {
    fn from(err: PluginError) -> Self {
        match err {
            PluginError::TokenExpired => PollError::TokenExpired,
            other => PollError::Plugin(other),
        }
    }
}

/// Helper 启动器与 helper 池的错误
#[derive(Debug, thiserror::Error)]
pub enum HelperError {
    #[error("can't find helper")]
    CantFindHelper,

    #[error("can't find launcher for helper: {0}")]
    CantFindLauncher(String),

    #[error("could not determine package for app: {0}")]
    InvalidAppId(String),

    #[error("unable to create output tempfile: {0}")]
    TempFile(#[from] io::Error),

    #[error("unable to launch helper: {0}")]
    Launch(String),

    #[error("unable to stop helper: {0}")]
    Stop(String),

    #[error("helper observer error: {0}")]
    Observer(String),

    #[error("helper pool is not running")]
    NotRunning,
}

/// 通知投递错误
#[derive(Debug, thiserror::Error)]
pub enum PostalError {
    #[error("APP_ID '{0}' is not valid")]
    InvalidAppId(String),

    #[error("notification backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// 配置加载错误
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_expired_maps_to_poll_error() {
        let err: PollError = PluginError::TokenExpired.into();
        assert_eq!(err, PollError::TokenExpired);

        let err: PollError = PluginError::Http("503".to_string()).into();
        assert_eq!(err, PollError::Plugin(PluginError::Http("503".to_string())));
    }

    #[test]
    fn test_counts_as_penalty() {
        assert!(PollError::Plugin(PluginError::Other("x".into())).counts_as_penalty());
        assert!(PollError::TaskFailed("panic".into()).counts_as_penalty());

        assert!(!PollError::NotInstalled.counts_as_penalty());
        assert!(!PollError::Blacklisted.counts_as_penalty());
        assert!(!PollError::AuthPending("denied".into()).counts_as_penalty());
        assert!(!PollError::TokenExpired.counts_as_penalty());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(HelperError::CantFindHelper.to_string(), "can't find helper");
        assert_eq!(
            PostalError::InvalidAppId("foo".into()).to_string(),
            "APP_ID 'foo' is not valid"
        );
    }
}
