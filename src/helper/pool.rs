//! HelperPool - 有界并发执行外部 helper
//!
//! 控制循环独占 `running` 和 backlog；只有 uid → 参数表会被定时器和完成回调
//! 同时访问，用互斥锁保护。每个实例的收尾由从表中移除它的一方负责，
//! 保证强制停止和自然结束竞争时只产生一个结果。

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backlog::Backlog;
use super::{HelperFailure, HelperInput, HelperLauncher, HelperResult};
use crate::click::{AppId, ClickApp};
use crate::errors::HelperError;
use crate::plugins::PushMessage;

/// 停止时在最长运行时间之外额外等待的时间
const STOP_GRACE: Duration = Duration::from_secs(2);

/// 输出临时文件名前缀
const TEMP_PREFIX: &str = "push-helper";

/// HelperPool 配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperPoolConfig {
    /// 同时运行的 helper 上限
    pub max_num: usize,
    /// 单个 helper 最长运行时间
    pub max_runtime: Duration,
    /// 输入队列容量
    pub input_buffer: usize,
    /// 临时文件根目录，默认 `$XDG_CACHE_HOME`
    pub temp_dir: Option<PathBuf>,
}

impl Default for HelperPoolConfig {
    fn default() -> Self {
        Self {
            max_num: 5,
            max_runtime: Duration::from_secs(5),
            input_buffer: 10,
            temp_dir: None,
        }
    }
}

/// 正在运行的 helper 实例
struct HelperArgs {
    input: HelperInput,
    file_out: PathBuf,
    timer: JoinHandle<()>,
    forced_stop: bool,
}

/// 控制循环、定时器与完成回调共享的状态
struct PoolShared {
    launcher: Arc<dyn HelperLauncher>,
    helpers: Mutex<HashMap<String, HelperArgs>>,
    done_tx: mpsc::UnboundedSender<AppId>,
    out_tx: mpsc::UnboundedSender<HelperResult>,
}

impl PoolShared {
    fn helpers(&self) -> MutexGuard<'_, HashMap<String, HelperArgs>> {
        self.helpers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fail_one(&self, app_id: AppId, failure: HelperFailure) {
        error!(app_id = %app_id, error = %failure, "Unable to get helper output");
        let _ = self.out_tx.send(HelperResult::failed(app_id, failure));
    }

    /// 超时：标记并请求启动器停止，结果仍由完成回调产生
    fn force_stop(&self, uid: &str) {
        let mut helpers = self.helpers();
        if let Some(args) = helpers.get_mut(uid) {
            args.forced_stop = true;
            warn!(app_id = %args.input.app_id, uid, "Helper exceeded its runtime, stopping");
            if let Err(e) = self.launcher.stop(&args.input.app_id, uid) {
                error!(app_id = %args.input.app_id, error = %e, "Unable to forcefully stop helper");
            }
        }
    }

    /// 实例结束回调
    fn one_done(&self, uid: &str) {
        let args = {
            let mut helpers = self.helpers();
            let args = helpers.remove(uid);
            if let Some(a) = &args {
                a.timer.abort();
            }
            args
        };
        let Some(args) = args else {
            debug!(uid, "Completion for unknown helper instance, ignoring");
            return;
        };

        let app_id = args.input.app_id.clone();
        let _ = self.done_tx.send(app_id.clone());

        let result = if args.forced_stop {
            HelperResult::failed(app_id.clone(), HelperFailure::ForcedStop)
        } else {
            match read_output(&args.file_out) {
                Ok(messages) => HelperResult::success(app_id.clone(), messages),
                Err(failure) => HelperResult::failed(app_id.clone(), failure),
            }
        };
        remove_temp_file(&args.file_out);

        match &result.failure {
            Some(failure) => error!(app_id = %app_id, error = %failure, "Unable to get helper output"),
            None => info!(app_id = %app_id, messages = result.messages.len(), "Helper finished"),
        }
        let _ = self.out_tx.send(result);
    }

    /// 停止时仍在表中的实例全部以 PoolStopped 收尾
    fn finalize_leftovers(&self) {
        let leftovers: Vec<HelperArgs> = self.helpers().drain().map(|(_, a)| a).collect();
        for args in leftovers {
            args.timer.abort();
            remove_temp_file(&args.file_out);
            self.fail_one(args.input.app_id, HelperFailure::PoolStopped);
        }
    }
}

fn read_output(path: &Path) -> Result<Vec<PushMessage>, HelperFailure> {
    let payload = fs::read(path).map_err(|e| HelperFailure::Read(e.to_string()))?;
    debug!(path = %path.display(), bytes = payload.len(), "Helper output");
    serde_json::from_slice(&payload).map_err(|e| HelperFailure::Parse(e.to_string()))
}

fn remove_temp_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        debug!(path = %path.display(), error = %e, "Unable to remove helper output file");
    }
}

/// 控制循环的独占状态
struct ControlLoop {
    shared: Arc<PoolShared>,
    max_num: usize,
    max_runtime: Duration,
    temp_dir: Option<PathBuf>,
    running: HashSet<AppId>,
    backlog: Backlog,
}

impl ControlLoop {
    async fn run(
        mut self,
        mut input_rx: mpsc::Receiver<HelperInput>,
        mut done_rx: mpsc::UnboundedReceiver<AppId>,
    ) {
        loop {
            tokio::select! {
                input = input_rx.recv() => match input {
                    Some(input) => self.on_input(input),
                    None => break,
                },
                Some(app_id) = done_rx.recv() => self.on_done(app_id),
            }
        }
        self.shutdown(done_rx).await;
    }

    fn on_input(&mut self, input: HelperInput) {
        if self.running.len() >= self.max_num || self.running.contains(&input.app_id) {
            self.backlog.push(input);
            debug!(backlog = self.backlog.len(), "Helper input backlog has grown");
            return;
        }
        let app_id = input.app_id.clone();
        if self.try_one(input) {
            self.running.insert(app_id);
        }
    }

    fn on_done(&mut self, app_id: AppId) {
        self.running.remove(&app_id);
        if self.backlog.is_empty() {
            return;
        }

        while self.running.len() < self.max_num {
            let Some(input) = self.backlog.take_next(&self.running) else {
                break;
            };
            let app_id = input.app_id.clone();
            if self.try_one(input) {
                self.running.insert(app_id);
            }
        }
        self.backlog.compact();
        debug!(backlog = self.backlog.len(), "Helper input backlog has shrunk");
    }

    /// 启动失败时立即产生失败结果，不重试
    fn try_one(&self, input: HelperInput) -> bool {
        let app_id = input.app_id.clone();
        match self.handle_one(input) {
            Ok(()) => true,
            Err(e) => {
                self.shared.fail_one(app_id, HelperFailure::from(&e));
                false
            }
        }
    }

    fn handle_one(&self, input: HelperInput) -> Result<(), HelperError> {
        if input.app_id.is_empty() || input.exec.is_empty() {
            return Err(HelperError::CantFindHelper);
        }
        debug!(app_id = %input.app_id, exec = %input.exec, "Using helper");

        let file_out = self.create_output_file(&input.app_id)?;

        // 持锁启动，保证完成回调看到的表中已有该实例
        let mut helpers = self.shared.helpers();
        let uid = match self.shared.launcher.launch(&input.app_id, &input.exec, &file_out) {
            Ok(uid) => uid,
            Err(e) => {
                remove_temp_file(&file_out);
                return Err(e);
            }
        };

        let timer = {
            let shared: Weak<PoolShared> = Arc::downgrade(&self.shared);
            let uid = uid.clone();
            let max_runtime = self.max_runtime;
            tokio::spawn(async move {
                tokio::time::sleep(max_runtime).await;
                if let Some(shared) = shared.upgrade() {
                    shared.force_stop(&uid);
                }
            })
        };

        helpers.insert(
            uid,
            HelperArgs {
                input,
                file_out,
                timer,
                forced_stop: false,
            },
        );
        Ok(())
    }

    fn create_output_file(&self, app_id: &AppId) -> Result<PathBuf, HelperError> {
        let app = ClickApp::parse(app_id).map_err(|_| HelperError::InvalidAppId(app_id.to_string()))?;
        let base = self
            .temp_dir
            .clone()
            .or_else(dirs::cache_dir)
            .unwrap_or_else(std::env::temp_dir);
        let dir = base.join(&app.package);
        fs::create_dir_all(&dir)?;

        let file = tempfile::Builder::new().prefix(TEMP_PREFIX).tempfile_in(&dir)?;
        let (_, path) = file.keep().map_err(|e| HelperError::TempFile(e.error))?;
        Ok(path)
    }

    async fn shutdown(mut self, mut done_rx: mpsc::UnboundedReceiver<AppId>) {
        for input in self.backlog.drain() {
            self.shared.fail_one(input.app_id, HelperFailure::PoolStopped);
        }

        if !self.running.is_empty() {
            info!(running = self.running.len(), "Waiting for running helpers");
            let running = &mut self.running;
            let wait = async {
                while !running.is_empty() {
                    match done_rx.recv().await {
                        Some(app_id) => {
                            running.remove(&app_id);
                        }
                        None => break,
                    }
                }
            };
            if tokio::time::timeout(self.max_runtime + STOP_GRACE, wait).await.is_err() {
                warn!(running = self.running.len(), "Helpers still running at shutdown");
            }
        }

        self.shared.finalize_leftovers();
        debug!("Helper pool control loop stopped");
    }
}

struct RunningPool {
    input_tx: mpsc::Sender<HelperInput>,
    control: JoinHandle<()>,
}

/// 有界 helper 执行池
pub struct HelperPool {
    config: HelperPoolConfig,
    launcher: Arc<dyn HelperLauncher>,
    running: Option<RunningPool>,
}

impl HelperPool {
    pub fn new(config: HelperPoolConfig, launcher: Arc<dyn HelperLauncher>) -> Self {
        Self {
            config,
            launcher,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// 启动控制循环，返回结果通道
    pub fn start(&mut self) -> Result<mpsc::UnboundedReceiver<HelperResult>, HelperError> {
        if self.running.is_some() {
            return Err(HelperError::Observer("helper pool already started".to_string()));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::channel(self.config.input_buffer.max(1));

        let shared = Arc::new(PoolShared {
            launcher: Arc::clone(&self.launcher),
            helpers: Mutex::new(HashMap::new()),
            done_tx,
            out_tx,
        });

        let observer_target = Arc::downgrade(&shared);
        self.launcher.install_observer(Box::new(move |uid: String| {
            if let Some(shared) = observer_target.upgrade() {
                shared.one_done(&uid);
            }
        }))?;

        let control = ControlLoop {
            shared,
            max_num: self.config.max_num.max(1),
            max_runtime: self.config.max_runtime,
            temp_dir: self.config.temp_dir.clone(),
            running: HashSet::new(),
            backlog: Backlog::default(),
        };
        let control = tokio::spawn(control.run(input_rx, done_rx));

        info!(max_num = self.config.max_num, max_runtime_secs = self.config.max_runtime.as_secs(), "Helper pool started");
        self.running = Some(RunningPool { input_tx, control });
        Ok(out_rx)
    }

    /// 提交一次 helper 执行；队列满时等待
    pub async fn run(&self, app_id: AppId, exec: impl Into<String>) -> Result<(), HelperError> {
        let running = self.running.as_ref().ok_or(HelperError::NotRunning)?;
        running
            .input_tx
            .send(HelperInput {
                app_id,
                exec: exec.into(),
            })
            .await
            .map_err(|_| HelperError::NotRunning)
    }

    /// 停止接收输入，等待控制循环收尾退出
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        drop(running.input_tx);
        if let Err(e) = running.control.await {
            error!(error = %e, "Helper pool control loop failed");
        }
        if let Err(e) = self.launcher.remove_observer() {
            warn!(error = %e, "Unable to remove helper observer");
        }
        info!("Helper pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_output_parses_message_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        fs::write(
            &path,
            r#"[{"notification": {"card": {"summary": "hi", "popup": true}}}]"#,
        )
        .unwrap();

        let messages = read_output(&path).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].summary(), Some("hi"));
    }

    #[test]
    fn test_read_output_failures() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        assert!(matches!(read_output(&missing), Err(HelperFailure::Read(_))));

        let garbage = dir.path().join("garbage");
        fs::write(&garbage, "not json").unwrap();
        assert!(matches!(read_output(&garbage), Err(HelperFailure::Parse(_))));
    }

    #[tokio::test]
    async fn test_output_file_under_package_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (done_tx, _done_rx) = mpsc::unbounded_channel();
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(PoolShared {
            launcher: Arc::new(super::super::ProcessLauncher::new()),
            helpers: Mutex::new(HashMap::new()),
            done_tx,
            out_tx,
        });
        let control = ControlLoop {
            shared,
            max_num: 1,
            max_runtime: Duration::from_secs(1),
            temp_dir: Some(dir.path().to_path_buf()),
            running: HashSet::new(),
            backlog: Backlog::default(),
        };

        let path = control
            .create_output_file(&AppId::new("com.example.feed_feed"))
            .unwrap();
        assert!(path.starts_with(dir.path().join("com.example.feed")));
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(TEMP_PREFIX));
        assert!(path.exists());

        assert!(matches!(
            control.create_output_file(&AppId::new("bogus")),
            Err(HelperError::InvalidAppId(_))
        ));
    }

    #[tokio::test]
    async fn test_run_before_start_is_error() {
        let pool = HelperPool::new(
            HelperPoolConfig::default(),
            Arc::new(super::super::ProcessLauncher::new()),
        );
        assert!(matches!(
            pool.run(AppId::new("com.example.feed_feed"), "/bin/true").await,
            Err(HelperError::NotRunning)
        ));
    }
}
