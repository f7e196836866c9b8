//! account-polld - 轮询在线账户与 poller helper，把新活动转为限流、去重的桌面通知

pub mod account_manager;
pub mod accounts;
pub mod click;
pub mod config;
pub mod daemon;
pub mod errors;
pub mod helper;
pub mod notification;
pub mod orchestrator;
pub mod plugins;

pub use account_manager::{AccountCommand, AccountContext, AccountHandle, AccountManager, PollSettings, PollStatus};
pub use accounts::{AccountId, AuthData, AuthError, CredentialWatcher, NoopWatcher};
pub use click::{AppId, AppIdError, AppRegistry, ClickApp, ClickRegistry};
pub use config::DaemonConfig;
pub use daemon::Daemon;
pub use errors::{ConfigError, HelperError, PluginError, PollError, PostalError};
pub use helper::{
    list_pollers, HelperFailure, HelperInput, HelperLauncher, HelperObserver, HelperPool, HelperPoolConfig,
    HelperResult, PollerInfo, ProcessLauncher,
};
pub use notification::{
    DeliveryReport, DryRunBackend, NotificationBackend, NotificationDispatcher, OutboxBackend, OutboxRecord,
    OutboxStore, PostWatch,
};
pub use orchestrator::{AccountRegistry, Orchestrator, PollRequest};
pub use plugins::{
    default_overflow, OverflowHandler, Plugin, PluginRegistry, PluginStore, PushMessage, PushMessageBatch,
};
