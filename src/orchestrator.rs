//! 调度中枢 - 把凭据事件和轮询信号分发到各账户，把 helper 结果送往邮局
//!
//! 账户表是 Orchestrator 持有的 `AccountRegistry`，不是全局状态。

use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::account_manager::{AccountContext, AccountHandle, AccountManager};
use crate::accounts::{AccountId, AuthData};
use crate::errors::HelperError;
use crate::helper::{list_pollers, HelperPool, HelperResult, PollerInfo};
use crate::notification::PostWatch;
use crate::plugins::{PluginRegistry, PushMessageBatch};

/// 一次轮询信号，`done` 在所有账户完成本轮后触发
#[derive(Debug, Default)]
pub struct PollRequest {
    pub done: Option<oneshot::Sender<()>>,
}

impl PollRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ack() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { done: Some(tx) }, rx)
    }
}

/// 账户 ID → 账户任务句柄
#[derive(Debug, Default)]
pub struct AccountRegistry {
    managers: HashMap<AccountId, AccountHandle>,
}

impl AccountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    pub fn contains(&self, account_id: AccountId) -> bool {
        self.managers.contains_key(&account_id)
    }

    pub fn get(&self, account_id: AccountId) -> Option<&AccountHandle> {
        self.managers.get(&account_id)
    }

    pub fn insert(&mut self, handle: AccountHandle) {
        if let Some(old) = self.managers.insert(handle.account_id(), handle) {
            warn!(account_id = old.account_id(), "Replacing existing account manager");
            tokio::spawn(old.delete());
        }
    }

    pub fn remove(&mut self, account_id: AccountId) -> Option<AccountHandle> {
        self.managers.remove(&account_id)
    }

    pub fn ids(&self) -> Vec<AccountId> {
        let mut ids: Vec<_> = self.managers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &AccountHandle> {
        self.managers.values()
    }

    /// 关闭所有账户任务并等待退出
    pub async fn shutdown(&mut self) {
        let handles: Vec<_> = self.managers.drain().map(|(_, h)| h.delete()).collect();
        futures::future::join_all(handles).await;
    }
}

/// 调度中枢
pub struct Orchestrator {
    plugins: PluginRegistry,
    ctx: AccountContext,
    accounts: AccountRegistry,
    pool: HelperPool,
    pollers_dir: PathBuf,
}

impl Orchestrator {
    pub fn new(plugins: PluginRegistry, ctx: AccountContext, pool: HelperPool, pollers_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugins,
            ctx,
            accounts: AccountRegistry::new(),
            pool,
            pollers_dir: pollers_dir.into(),
        }
    }

    pub fn accounts(&self) -> &AccountRegistry {
        &self.accounts
    }

    /// 处理一条凭据事件
    pub async fn handle_auth(&mut self, auth: AuthData) {
        let account_id = auth.account_id;

        if self.accounts.contains(account_id) {
            if auth.enabled {
                info!(account_id, "New account data for existing account");
                if let Some(handle) = self.accounts.get(account_id) {
                    handle.update_auth_data(auth);
                }
            } else if let Some(handle) = self.accounts.remove(account_id) {
                info!(account_id, "Account disabled, removing");
                tokio::spawn(handle.delete());
            }
            return;
        }

        if !auth.enabled {
            debug!(account_id, "Ignoring disabled unknown account");
            return;
        }

        let Some(plugin) = self.plugins.create(&auth.service_name, account_id) else {
            info!(account_id, service = %auth.service_name, "Unhandled account");
            return;
        };

        info!(account_id, service = %auth.service_name, "Creating account");
        let handle = AccountManager::new(auth, plugin, self.ctx.clone()).spawn();
        handle.request_poll(true, None);
        self.accounts.insert(handle);
    }

    /// 处理一次轮询信号：所有账户轮询一次，所有 poller 提交到 HelperPool
    pub async fn handle_poll_signal(&mut self, request: PollRequest) {
        info!(accounts = self.accounts.len(), "Starting to poll available accounts");

        let mut pending = Vec::with_capacity(self.accounts.len());
        for handle in self.accounts.iter() {
            let (tx, rx) = oneshot::channel();
            handle.signal_poll(Some(tx));
            pending.push(rx);
        }

        for poller in self.discover_pollers().await {
            info!(app_id = %poller.app_id, "Running poller for application");
            if let Err(e) = self.pool.run(poller.app_id.clone(), poller.exec).await {
                warn!(app_id = %poller.app_id, error = %e, "Unable to submit poller");
            }
        }

        if let Some(done) = request.done {
            tokio::spawn(async move {
                // 合并或已停止的账户会直接丢弃回执，同样视为完成
                futures::future::join_all(pending).await;
                let _ = done.send(());
            });
        }
    }

    async fn discover_pollers(&self) -> Vec<PollerInfo> {
        let dir = self.pollers_dir.clone();
        match tokio::task::spawn_blocking(move || list_pollers(&dir)).await {
            Ok(pollers) => pollers,
            Err(e) => {
                warn!(error = %e, "Poller discovery failed");
                Vec::new()
            }
        }
    }

    /// helper 结果转为不限量的批次（tag 为应用 ID）
    pub async fn forward_helper_result(&self, result: HelperResult) {
        if let Some(failure) = &result.failure {
            warn!(app_id = %result.app_id, error = %failure, "Poller failed");
            return;
        }
        if result.messages.is_empty() {
            debug!(app_id = %result.app_id, "Poller reported no messages");
            return;
        }

        let batch = PushMessageBatch::unlimited(result.app_id.as_str(), result.messages);
        let post = PostWatch::new(result.app_id.clone(), vec![batch]);
        if self.ctx.post_tx.send(post).await.is_err() {
            warn!(app_id = %result.app_id, "Post office is closed, dropping poller messages");
        }
    }

    /// 主循环，直到取消或两个输入都关闭
    pub async fn run(
        mut self,
        mut auth_rx: mpsc::Receiver<AuthData>,
        mut poll_rx: mpsc::Receiver<PollRequest>,
        shutdown: CancellationToken,
    ) -> Result<(), HelperError> {
        let mut helper_rx = self.pool.start()?;
        let mut auth_open = true;
        let mut poll_open = true;

        info!("Monitoring accounts");
        while auth_open || poll_open {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Orchestrator shutting down");
                    break;
                }
                auth = auth_rx.recv(), if auth_open => match auth {
                    Some(auth) => self.handle_auth(auth).await,
                    None => {
                        info!("Credential feed closed");
                        auth_open = false;
                    }
                },
                request = poll_rx.recv(), if poll_open => match request {
                    Some(request) => self.handle_poll_signal(request).await,
                    None => {
                        debug!("Poll signal source closed");
                        poll_open = false;
                    }
                },
                Some(result) = helper_rx.recv() => self.forward_helper_result(result).await,
            }
        }

        // 池停止后结果通道在最后一个收尾回调结束时关闭
        self.pool.stop().await;
        while let Some(result) = helper_rx.recv().await {
            self.forward_helper_result(result).await;
        }
        self.accounts.shutdown().await;
        info!("Orchestrator stopped");
        Ok(())
    }
}
