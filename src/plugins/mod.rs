//! 插件层 - 每个服务（Gmail、Twitter、Facebook、IMAP…）一个实现
//!
//! 插件只负责"轮询该服务，返回消息批次"。协议细节和去重状态都由插件自己
//! 持有，核心只通过 [`Plugin`] trait 调用它们。

pub mod message;
pub mod persist;

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;

use crate::accounts::{AccountId, AuthData};
use crate::errors::PluginError;

pub use crate::click::AppId;
pub use message::{default_overflow, Card, Notification, OverflowHandler, PushMessage, PushMessageBatch};
pub use persist::PluginStore;

/// 服务插件
#[async_trait]
pub trait Plugin: Send {
    /// 通知投递到的目标应用
    fn application_id(&self) -> AppId;

    /// 轮询一次服务
    ///
    /// 令牌过期时返回 [`PluginError::TokenExpired`]。
    async fn poll(&mut self, auth: &AuthData) -> Result<Vec<PushMessageBatch>, PluginError>;
}

/// 按账户创建插件实例
pub type PluginFactory = Box<dyn Fn(AccountId) -> Box<dyn Plugin> + Send + Sync>;

/// 服务名 → 插件工厂
#[derive(Default)]
pub struct PluginRegistry {
    factories: HashMap<String, PluginFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册服务插件
    pub fn register<F>(&mut self, service_name: impl Into<String>, factory: F)
    where
        F: Fn(AccountId) -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        self.factories.insert(service_name.into(), Box::new(factory));
    }

    pub fn with<F>(mut self, service_name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(AccountId) -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        self.register(service_name, factory);
        self
    }

    /// 为账户创建插件，未注册的服务返回 `None`
    pub fn create(&self, service_name: &str, account_id: AccountId) -> Option<Box<dyn Plugin>> {
        self.factories.get(service_name).map(|f| f(account_id))
    }

    pub fn contains(&self, service_name: &str) -> bool {
        self.factories.contains_key(service_name)
    }

    pub fn services(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("services", &self.services())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoPlugin {
        account_id: AccountId,
    }

    #[async_trait]
    impl Plugin for EchoPlugin {
        fn application_id(&self) -> AppId {
            AppId::new(format!("com.example.echo_echo{}", self.account_id))
        }

        async fn poll(&mut self, _auth: &AuthData) -> Result<Vec<PushMessageBatch>, PluginError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_registry_creates_per_account() {
        let registry = PluginRegistry::new()
            .with("echo", |id| Box::new(EchoPlugin { account_id: id }) as Box<dyn Plugin>);

        assert!(registry.contains("echo"));
        assert_eq!(registry.services(), vec!["echo"]);

        let plugin = registry.create("echo", 5).unwrap();
        assert_eq!(plugin.application_id().as_str(), "com.example.echo_echo5");
        assert!(registry.create("unknown", 5).is_none());
    }
}
