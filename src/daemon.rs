//! 守护进程装配 - 邮局、HelperPool、Orchestrator 与定时轮询
//!
//! 所有循环共享一个 `CancellationToken`，收到 SIGINT/SIGTERM 后依次收尾：
//! Orchestrator 停止 HelperPool 并关闭账户任务，最后邮局处理完剩余批次。

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::account_manager::AccountContext;
use crate::accounts::{AuthData, CredentialWatcher, NoopWatcher};
use crate::click::{AppRegistry, ClickRegistry};
use crate::config::DaemonConfig;
use crate::helper::{HelperLauncher, HelperPool, ProcessLauncher};
use crate::notification::{DryRunBackend, NotificationBackend, NotificationDispatcher, OutboxBackend};
use crate::orchestrator::{Orchestrator, PollRequest};
use crate::plugins::PluginRegistry;

/// 邮局队列容量
const POST_QUEUE_SIZE: usize = 64;

/// 关闭时等待邮局清空队列的上限
const POST_OFFICE_DRAIN: Duration = Duration::from_secs(10);

/// 守护进程
pub struct Daemon {
    config: DaemonConfig,
    plugins: PluginRegistry,
    apps: Arc<dyn AppRegistry>,
    watcher: Arc<dyn CredentialWatcher>,
    backend: Arc<dyn NotificationBackend>,
    launcher: Arc<dyn HelperLauncher>,
}

impl Daemon {
    /// 默认组件：用户的 click 应用目录、JSONL 发件箱、子进程启动器
    pub fn new(config: DaemonConfig) -> Self {
        let apps = ClickRegistry::for_user().with_blacklist(config.blacklist.clone());
        let backend = OutboxBackend::new(config.outbox_path.clone());
        Self {
            config,
            plugins: PluginRegistry::new(),
            apps: Arc::new(apps),
            watcher: Arc::new(NoopWatcher),
            backend: Arc::new(backend),
            launcher: Arc::new(ProcessLauncher::new()),
        }
    }

    pub fn with_plugins(mut self, plugins: PluginRegistry) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn with_apps(mut self, apps: Arc<dyn AppRegistry>) -> Self {
        self.apps = apps;
        self
    }

    pub fn with_watcher(mut self, watcher: Arc<dyn CredentialWatcher>) -> Self {
        self.watcher = watcher;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn NotificationBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn HelperLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// dry-run 模式只记录将要投递的通知
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        if dry_run {
            self.backend = Arc::new(DryRunBackend);
        }
        self
    }

    /// 运行直到 `shutdown` 被取消
    pub async fn run(self, auth_rx: mpsc::Receiver<AuthData>, shutdown: CancellationToken) -> Result<()> {
        let Daemon {
            config,
            plugins,
            apps,
            watcher,
            backend,
            launcher,
        } = self;

        info!(
            services = ?plugins.services(),
            poll_interval_secs = config.poll_interval_secs,
            pollers_dir = %config.pollers_dir.display(),
            "Starting account-polld"
        );

        let (post_tx, post_rx) = mpsc::channel(POST_QUEUE_SIZE);
        let post_office = tokio::spawn(NotificationDispatcher::new(backend).run(post_rx));

        let ctx = AccountContext {
            settings: config.poll_settings(),
            apps,
            watcher,
            post_tx,
        };
        let pool = HelperPool::new(config.helper_pool_config(), launcher);
        let orchestrator = Orchestrator::new(plugins, ctx, pool, config.pollers_dir.clone());

        let (poll_tx, poll_rx) = mpsc::channel(1);
        let ticker = tokio::spawn(poll_ticker(config.poll_interval(), poll_tx, shutdown.clone()));

        let result = orchestrator.run(auth_rx, poll_rx, shutdown.clone()).await;
        shutdown.cancel();

        if let Err(e) = ticker.await {
            warn!(error = %e, "Poll ticker task failed");
        }

        // 被放弃的轮询任务可能仍持有发送端，等待有上限
        match tokio::time::timeout(POST_OFFICE_DRAIN, post_office).await {
            Ok(joined) => joined.context("post office task failed")?,
            Err(_) => warn!("Post office did not drain in time"),
        }

        result.context("orchestrator failed")?;
        info!("account-polld stopped");
        Ok(())
    }
}

/// 定时发出轮询信号；上一轮未完成时不会发出新信号
pub async fn poll_ticker(period: Duration, tx: mpsc::Sender<PollRequest>, shutdown: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let (request, ack) = PollRequest::with_ack();
        if tx.send(request).await.is_err() {
            debug!("Orchestrator gone, stopping poll ticker");
            break;
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            res = ack => match res {
                Ok(()) => debug!("Poll cycle finished"),
                Err(_) => debug!("Poll cycle abandoned"),
            },
        }
    }
    debug!("Poll ticker stopped");
}

/// 等待 SIGTERM 或 SIGINT，然后取消 `token`
pub async fn wait_for_shutdown_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!(signal = "SIGINT", "Signal received"),
                    _ = sigterm.recv() => info!(signal = "SIGTERM", "Signal received"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to register SIGTERM handler");
                ctrl_c.await.ok();
                info!(signal = "SIGINT", "Signal received");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!(signal = "SIGINT", "Signal received");
    }

    token.cancel();
}
