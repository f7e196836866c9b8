//! 基于子进程的 helper 启动器
//!
//! helper 以输出文件路径为唯一参数运行，环境变量 `APP_ID` 为目标应用。
//! 每个实例结束（正常退出或被停止）时调用一次观察者。

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{HelperLauncher, HelperObserver};
use crate::click::AppId;
use crate::errors::HelperError;

type SharedObserver = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Default)]
struct LauncherInner {
    observer: Mutex<Option<SharedObserver>>,
    kills: Mutex<HashMap<String, oneshot::Sender<()>>>,
    next_id: AtomicU64,
}

impl LauncherInner {
    fn kills(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<()>>> {
        self.kills.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn observer(&self) -> MutexGuard<'_, Option<SharedObserver>> {
        self.observer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, instance_id: String) {
        // 回调在锁外执行
        let observer = self.observer().clone();
        match observer {
            Some(observer) => observer(instance_id),
            None => debug!(instance_id = %instance_id, "Helper finished with no observer installed"),
        }
    }
}

/// tokio::process 启动器
#[derive(Clone, Default)]
pub struct ProcessLauncher {
    inner: Arc<LauncherInner>,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HelperLauncher for ProcessLauncher {
    fn install_observer(&self, observer: HelperObserver) -> Result<(), HelperError> {
        let mut slot = self.inner.observer();
        if slot.is_some() {
            return Err(HelperError::Observer("observer already installed".to_string()));
        }
        *slot = Some(Arc::from(observer));
        Ok(())
    }

    fn remove_observer(&self) -> Result<(), HelperError> {
        self.inner
            .observer()
            .take()
            .map(|_| ())
            .ok_or_else(|| HelperError::Observer("no observer installed".to_string()))
    }

    fn launch(&self, app_id: &AppId, exec: &str, output: &Path) -> Result<String, HelperError> {
        let program = which::which(exec).map_err(|e| HelperError::CantFindLauncher(format!("{}: {}", exec, e)))?;

        let mut child = Command::new(&program)
            .arg(output)
            .env("APP_ID", app_id.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HelperError::Launch(format!("{}: {}", program.display(), e)))?;

        let instance_id = (self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        let (kill_tx, kill_rx) = oneshot::channel();
        self.inner.kills().insert(instance_id.clone(), kill_tx);

        info!(app_id = %app_id, instance_id = %instance_id, exec = %program.display(), "Launched helper");

        let inner = Arc::clone(&self.inner);
        let iid = instance_id.clone();
        let app = app_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => debug!(app_id = %app, instance_id = %iid, %status, "Helper exited"),
                    Err(e) => warn!(app_id = %app, instance_id = %iid, error = %e, "Failed to wait for helper"),
                },
                Ok(()) = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(app_id = %app, instance_id = %iid, error = %e, "Failed to kill helper");
                    }
                    debug!(app_id = %app, instance_id = %iid, "Helper killed");
                }
            }
            inner.kills().remove(&iid);
            inner.notify(iid);
        });

        Ok(instance_id)
    }

    fn stop(&self, app_id: &AppId, instance_id: &str) -> Result<(), HelperError> {
        let kill = self
            .inner
            .kills()
            .remove(instance_id)
            .ok_or_else(|| HelperError::Stop(format!("no running instance {} for {}", instance_id, app_id)))?;
        kill.send(())
            .map_err(|_| HelperError::Stop(format!("instance {} already finished", instance_id)))
    }
}
