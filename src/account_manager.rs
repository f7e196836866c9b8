//! 账户轮询调度 - 每个账户一个 AccountManager
//!
//! 负责决定何时轮询账户、限制异常服务的影响范围，并串行化对插件的访问：
//! - 每个惩罚点跳过一轮轮询（无定时器的退避）
//! - 轮询在独立任务中执行，与超时赛跑；超时的任务被放弃而不是取消，
//!   它之后的结果不会再写回管理器状态
//! - 令牌过期时请求刷新并停用账户，直到收到新的认证数据
//! - 被放弃的轮询（超时或账户关闭）不会再把结果送往邮局

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::accounts::{AccountId, AuthData, AuthError, CredentialWatcher};
use crate::click::{AppId, AppRegistry};
use crate::errors::PollError;
use crate::notification::PostWatch;
use crate::plugins::Plugin;

/// 轮询超时与惩罚上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// 常规轮询超时
    pub poll_timeout: Duration,
    /// 账户首次轮询超时（更长）
    pub bootstrap_poll_timeout: Duration,
    /// 惩罚计数上限
    pub max_penalty: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(30),
            bootstrap_poll_timeout: Duration::from_secs(4 * 60),
            max_penalty: 4,
        }
    }
}

/// AccountManager 共享的外部依赖
#[derive(Clone)]
pub struct AccountContext {
    pub settings: PollSettings,
    pub apps: Arc<dyn AppRegistry>,
    pub watcher: Arc<dyn CredentialWatcher>,
    pub post_tx: mpsc::Sender<PostWatch>,
}

/// 一次 `poll` 调用的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    /// 账户未启用（包括等待令牌刷新）
    Disabled,
    /// 黑名单或未安装，跳过且不计惩罚
    Skipped(PollError),
    /// 处于惩罚期，跳过本轮
    Penalized { remaining: u32 },
    /// 令牌刷新中，定时轮询跳过
    AwaitingRefresh,
    Succeeded { batches: usize },
    Failed(PollError),
    TimedOut,
}

/// 单个账户的轮询调度器
pub struct AccountManager {
    auth: AuthData,
    app_id: AppId,
    plugin: Arc<Mutex<Box<dyn Plugin>>>,
    penalty: u32,
    ctx: AccountContext,
    /// 管理器关闭时取消，连带取消所有未完成轮询的守卫
    stopped: CancellationToken,
}

impl AccountManager {
    pub fn new(auth: AuthData, plugin: Box<dyn Plugin>, ctx: AccountContext) -> Self {
        let app_id = plugin.application_id();
        Self {
            auth,
            app_id,
            plugin: Arc::new(Mutex::new(plugin)),
            penalty: 0,
            ctx,
            stopped: CancellationToken::new(),
        }
    }

    pub fn account_id(&self) -> AccountId {
        self.auth.account_id
    }

    pub fn app_id(&self) -> &AppId {
        &self.app_id
    }

    pub fn auth_data(&self) -> &AuthData {
        &self.auth
    }

    pub fn is_enabled(&self) -> bool {
        self.auth.enabled
    }

    pub fn penalty_count(&self) -> u32 {
        self.penalty
    }

    /// 整体替换认证数据，返回账户是否仍启用
    pub fn update_auth_data(&mut self, auth: AuthData) -> bool {
        if auth.account_id != self.auth.account_id {
            warn!(
                account_id = self.auth.account_id,
                got = auth.account_id,
                "Ignoring auth data for a different account"
            );
            return self.auth.enabled;
        }
        self.auth = auth;
        self.auth.enabled
    }

    fn penalize(&mut self) {
        if self.penalty < self.ctx.settings.max_penalty {
            self.penalty += 1;
        }
    }

    /// 轮询一次账户
    ///
    /// `bootstrap` 为 true 时使用更长的首次超时。
    pub async fn poll(&mut self, bootstrap: bool) -> PollStatus {
        let account_id = self.auth.account_id;

        if !self.auth.enabled {
            debug!(account_id, "Account not enabled, not polling");
            return PollStatus::Disabled;
        }

        if self.ctx.apps.is_blacklisted(&self.app_id) {
            info!(account_id, app_id = %self.app_id, "Account is blacklisted, not polling");
            return PollStatus::Skipped(PollError::Blacklisted);
        }

        if !self.ctx.apps.is_installed(&self.app_id) {
            info!(account_id, app_id = %self.app_id, "Target app is not installed, not polling");
            return PollStatus::Skipped(PollError::NotInstalled);
        }

        if self.penalty > 0 {
            info!(account_id, penalty = self.penalty, "Leaving poll for account as penalty count is set");
            self.penalty -= 1;
            return PollStatus::Penalized {
                remaining: self.penalty,
            };
        }

        let timeout = if bootstrap {
            self.ctx.settings.bootstrap_poll_timeout
        } else {
            self.ctx.settings.poll_timeout
        };

        info!(account_id, bootstrap, "Starting poll for account");
        let abandoned = self.stopped.child_token();
        let task = PollTask {
            auth: self.auth.clone(),
            app_id: self.app_id.clone(),
            plugin: Arc::clone(&self.plugin),
            apps: Arc::clone(&self.ctx.apps),
            watcher: Arc::clone(&self.ctx.watcher),
            post_tx: self.ctx.post_tx.clone(),
            abandoned: abandoned.clone(),
        };
        let handle = tokio::spawn(task.run());

        // 超时时 JoinHandle 被丢弃，任务继续运行但结果被丢弃
        let status = match tokio::time::timeout(timeout, handle).await {
            Err(_) => {
                abandoned.cancel();
                warn!(account_id, timeout_secs = timeout.as_secs(), "Poll for account has timed out");
                self.penalize();
                PollStatus::TimedOut
            }
            Ok(Err(join_err)) => {
                let err = PollError::TaskFailed(join_err.to_string());
                warn!(account_id, error = %err, "Poll for account has failed");
                self.penalize();
                PollStatus::Failed(err)
            }
            Ok(Ok(Ok(batches))) => {
                info!(account_id, batches, "Poll for account was successful");
                self.penalty = 0;
                PollStatus::Succeeded { batches }
            }
            Ok(Ok(Err(err))) => {
                match &err {
                    PollError::TokenExpired => {
                        self.auth.enabled = false;
                        self.auth.error = Some(AuthError::TokenExpired);
                    }
                    e if e.counts_as_penalty() => {
                        warn!(account_id, error = %e, "Poll for account has failed");
                        self.penalize();
                    }
                    _ => {}
                }
                PollStatus::Failed(err)
            }
        };

        debug!(account_id, penalty = self.penalty, "Ending poll for account");
        status
    }

    /// 定时轮询信号的处理
    ///
    /// 令牌刷新中的账户跳过；带其他认证错误的账户清除错误和惩罚后重试。
    pub async fn scheduled_poll(&mut self) -> PollStatus {
        if self.auth.is_refreshing() {
            info!(account_id = self.auth.account_id, "Skipping account as it is refreshing its token");
            return PollStatus::AwaitingRefresh;
        }

        if self.auth.error.is_some() {
            info!(account_id = self.auth.account_id, "Retrying to authenticate existing account");
            self.penalty = 0;
            self.auth.error = None;
        }

        self.poll(false).await
    }

    /// 在独立任务中运行，返回句柄
    pub fn spawn(self) -> AccountHandle {
        let account_id = self.account_id();
        let stopped = self.stopped.clone();
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let (auth_tx, auth_rx) = watch::channel(self.auth.clone());
        let task = tokio::spawn(self.run(rx, auth_rx));
        AccountHandle {
            account_id,
            tx,
            auth_tx,
            stopped,
            task,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<AccountCommand>, mut auth_rx: watch::Receiver<AuthData>) {
        let account_id = self.account_id();
        let stopped = self.stopped.clone();

        loop {
            let cmd = tokio::select! {
                biased;
                _ = stopped.cancelled() => break,
                changed = auth_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let auth = auth_rx.borrow_and_update().clone();
                    if !self.update_auth_data(auth) {
                        info!(account_id, "Account no longer enabled");
                        break;
                    }
                    info!(account_id, "New account data for existing account");
                    self.penalty = 0;
                    AccountCommand::Poll { bootstrap: false, done: None }
                }
                cmd = rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };

            // 关闭时不等待进行中的轮询
            let finished = match cmd {
                AccountCommand::Poll { bootstrap, done } => tokio::select! {
                    biased;
                    _ = stopped.cancelled() => false,
                    status = self.poll(bootstrap) => {
                        if let Some(done) = done {
                            let _ = done.send(status);
                        }
                        true
                    }
                },
                AccountCommand::Scheduled { done } => tokio::select! {
                    biased;
                    _ = stopped.cancelled() => false,
                    status = self.scheduled_poll() => {
                        if let Some(done) = done {
                            let _ = done.send(status);
                        }
                        true
                    }
                },
            };
            if !finished {
                info!(account_id, "Abandoning in-flight poll, account manager stopping");
                break;
            }
        }
        debug!(account_id, "Account manager stopped");
    }
}

impl Drop for AccountManager {
    fn drop(&mut self) {
        self.stopped.cancel();
    }
}

const COMMAND_BUFFER: usize = 4;

/// 发给账户任务的轮询命令
#[derive(Debug)]
pub enum AccountCommand {
    /// 立即轮询
    Poll {
        bootstrap: bool,
        done: Option<oneshot::Sender<PollStatus>>,
    },
    /// 定时轮询信号
    Scheduled { done: Option<oneshot::Sender<PollStatus>> },
}

/// 账户任务句柄
///
/// 认证数据走单独的 watch 通道，只保留最新值，发送方从不阻塞。
#[derive(Debug)]
pub struct AccountHandle {
    account_id: AccountId,
    tx: mpsc::Sender<AccountCommand>,
    auth_tx: watch::Sender<AuthData>,
    stopped: CancellationToken,
    task: JoinHandle<()>,
}

impl AccountHandle {
    pub fn account_id(&self) -> AccountId {
        self.account_id
    }

    /// 转交新认证数据；未处理的旧数据被覆盖
    pub fn update_auth_data(&self, auth: AuthData) {
        self.auth_tx.send_replace(auth);
    }

    /// 请求轮询；已有命令排队时合并，`done` 直接被丢弃
    pub fn request_poll(&self, bootstrap: bool, done: Option<oneshot::Sender<PollStatus>>) {
        self.try_send(AccountCommand::Poll { bootstrap, done });
    }

    /// 转发定时轮询信号
    pub fn signal_poll(&self, done: Option<oneshot::Sender<PollStatus>>) {
        self.try_send(AccountCommand::Scheduled { done });
    }

    fn try_send(&self, cmd: AccountCommand) {
        if let Err(e) = self.tx.try_send(cmd) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    debug!(account_id = self.account_id, "Poll already queued for account, coalescing")
                }
                mpsc::error::TrySendError::Closed(_) => {
                    debug!(account_id = self.account_id, "Account manager already stopped")
                }
            }
        }
    }

    /// 停止账户任务：放弃进行中的轮询和排队的命令，等待任务退出
    pub async fn delete(self) {
        self.stopped.cancel();
        drop(self.tx);
        if let Err(e) = self.task.await {
            warn!(account_id = self.account_id, error = %e, "Account manager task failed");
        }
    }
}

/// 在独立任务中执行的一次轮询
///
/// 只持有状态副本，超时后被放弃也不会影响管理器。
struct PollTask {
    auth: AuthData,
    app_id: AppId,
    plugin: Arc<Mutex<Box<dyn Plugin>>>,
    apps: Arc<dyn AppRegistry>,
    watcher: Arc<dyn CredentialWatcher>,
    post_tx: mpsc::Sender<PostWatch>,
    /// 超时或管理器关闭后被取消，之后的结果一律丢弃
    abandoned: CancellationToken,
}

impl PollTask {
    async fn run(self) -> Result<usize, PollError> {
        let account_id = self.auth.account_id;
        debug!(account_id, "Polling account");

        if !self.apps.is_installed(&self.app_id) {
            info!(account_id, app_id = %self.app_id, "Skipping account as target app is not installed");
            return Err(PollError::NotInstalled);
        }

        if let Some(err) = &self.auth.error {
            info!(account_id, error = %err, "Account failed to authenticate");
            return Err(PollError::AuthPending(err.to_string()));
        }

        // 同一账户的轮询在这里串行
        let mut plugin = self.plugin.lock().await;
        let result = plugin.poll(&self.auth).await;
        drop(plugin);

        if self.abandoned.is_cancelled() {
            debug!(account_id, "Discarding result of abandoned poll");
            return Err(PollError::TaskFailed("poll abandoned".to_string()));
        }

        let batches = match result {
            Ok(b) => b,
            Err(e) => {
                warn!(account_id, error = %e, "Error while polling account");
                let err = PollError::from(e);
                if err == PollError::TokenExpired {
                    self.watcher.refresh(account_id);
                }
                return Err(err);
            }
        };

        let batches: Vec<_> = batches.into_iter().filter(|b| !b.is_empty()).collect();
        for b in &batches {
            info!(account_id, tag = %b.tag, updates = b.len(), "Account has updates to report");
        }

        let count = batches.len();
        if count > 0 {
            let post = PostWatch::new(self.app_id.clone(), batches);
            tokio::select! {
                biased;
                _ = self.abandoned.cancelled() => {
                    debug!(account_id, "Discarding result of abandoned poll");
                    return Err(PollError::TaskFailed("poll abandoned".to_string()));
                }
                sent = self.post_tx.send(post) => {
                    sent.map_err(|_| PollError::TaskFailed("post office is closed".to_string()))?;
                }
            }
        }
        Ok(count)
    }
}
