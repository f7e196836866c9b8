//! 插件状态持久化
//!
//! 每个插件自行维护去重状态（已上报 ID、时间水位等），以 JSON 保存在
//! `<data_dir>/account-polld/<plugin>/<account_id>.json`。

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::PathBuf;

use crate::accounts::AccountId;

/// 插件状态存储
#[derive(Debug, Clone)]
pub struct PluginStore {
    base_dir: PathBuf,
}

impl PluginStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// `~/.local/share/account-polld`
    pub fn for_user() -> Self {
        let dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("account-polld");
        Self::new(dir)
    }

    pub fn path(&self, plugin: &str, account_id: AccountId) -> PathBuf {
        self.base_dir.join(plugin).join(format!("{}.json", account_id))
    }

    /// 读取状态，文件不存在时返回默认值
    pub fn load<T>(&self, plugin: &str, account_id: AccountId) -> io::Result<T>
    where
        T: DeserializeOwned + Default,
    {
        let path = self.path(plugin, account_id);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => return Err(e),
        };

        serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// 原子写入状态（先写临时文件再 rename）
    pub fn save<T: Serialize>(&self, plugin: &str, account_id: AccountId, state: &T) -> io::Result<()> {
        let path = self.path(plugin, account_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let data = serde_json::to_string(state)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let temp = path.with_extension("json.tmp");
        fs::write(&temp, data)?;
        fs::rename(&temp, &path)?;
        Ok(())
    }
}
