//! 账户认证数据 - 来自外部凭据监视器
//!
//! 凭据监视器（账户与认证服务）以流的形式推送 `AuthData`。每条记录整体替换
//! 该账户之前的数据，从不做局部修改。令牌过期时，通过 `CredentialWatcher`
//! 请求上游刷新，新数据会重新出现在同一条流上。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// 账户 ID（由账户服务分配，不透明）
pub type AccountId = u32;

/// 认证数据上携带的错误
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum AuthError {
    /// 令牌已过期，正在等待刷新
    TokenExpired,
    /// 认证失败
    Failed(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::TokenExpired => f.write_str("token expired"),
            AuthError::Failed(msg) => f.write_str(msg),
        }
    }
}

/// 单个账户的认证数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthData {
    pub account_id: AccountId,
    pub service_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub auth_method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AuthError>,
    /// 凭据键值对，如 `AccessToken`、`ClientSecret`
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
}

impl AuthData {
    pub fn new(account_id: AccountId, service_name: impl Into<String>) -> Self {
        Self {
            account_id,
            service_name: service_name.into(),
            enabled: true,
            auth_method: String::new(),
            error: None,
            credentials: BTreeMap::new(),
        }
    }

    pub fn with_credential(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.credentials.insert(key.into(), value.into());
        self
    }

    pub fn with_error(mut self, error: AuthError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// 读取凭据
    pub fn credential(&self, key: &str) -> Option<&str> {
        self.credentials.get(key).map(String::as_str)
    }

    pub fn access_token(&self) -> Option<&str> {
        self.credential("AccessToken")
    }

    /// 是否正在等待令牌刷新
    pub fn is_refreshing(&self) -> bool {
        matches!(self.error, Some(AuthError::TokenExpired))
    }
}

/// 上游凭据监视器
pub trait CredentialWatcher: Send + Sync {
    /// 请求刷新指定账户的令牌，新数据通过凭据流送达
    fn refresh(&self, account_id: AccountId);
}

/// 不做任何事的监视器，用于没有凭据源的场景
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWatcher;

impl CredentialWatcher for NoopWatcher {
    fn refresh(&self, account_id: AccountId) {
        tracing::debug!(account_id, "No credential watcher attached, refresh ignored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_data_builder() {
        let auth = AuthData::new(7, "gmail")
            .with_credential("AccessToken", "tok")
            .with_credential("ClientSecret", "sec");

        assert!(auth.enabled);
        assert_eq!(auth.access_token(), Some("tok"));
        assert_eq!(auth.credential("ClientSecret"), Some("sec"));
        assert_eq!(auth.credential("Missing"), None);
        assert!(!auth.is_refreshing());
    }

    #[test]
    fn test_refreshing_only_for_token_expiry() {
        let expired = AuthData::new(1, "x").with_error(AuthError::TokenExpired);
        assert!(expired.is_refreshing());

        let failed = AuthData::new(1, "x").with_error(AuthError::Failed("denied".into()));
        assert!(!failed.is_refreshing());
    }

    #[test]
    fn test_auth_data_deserialize_defaults() {
        let auth: AuthData = serde_json::from_str(
            r#"{"account_id": 3, "service_name": "twitter", "enabled": false}"#,
        )
        .unwrap();
        assert_eq!(auth.account_id, 3);
        assert!(!auth.enabled);
        assert!(auth.credentials.is_empty());
        assert!(auth.error.is_none());
    }
}
