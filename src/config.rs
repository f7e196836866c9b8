//! 守护进程配置
//!
//! 读取优先级（后者覆盖前者）：
//! 1. 内置默认值
//! 2. 配置文件 `~/.config/account-polld/config.json`（JSON，字段均可选）
//! 3. 环境变量 `ACCOUNT_POLLD_*`

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::account_manager::PollSettings;
use crate::errors::ConfigError;
use crate::helper::HelperPoolConfig;

/// 环境变量前缀
pub const ENV_PREFIX: &str = "ACCOUNT_POLLD_";

/// 守护进程配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// 定时轮询间隔（秒）
    pub poll_interval_secs: u64,
    /// 常规轮询超时（秒）
    pub poll_timeout_secs: u64,
    /// 账户首次轮询超时（秒）
    pub bootstrap_poll_timeout_secs: u64,
    /// 惩罚计数上限
    pub max_penalty: u32,
    /// 同时运行的 helper 上限
    pub helper_max_num: usize,
    /// 单个 helper 最长运行时间（秒）
    pub helper_max_runtime_secs: u64,
    /// helper 输入队列容量
    pub helper_input_buffer: usize,
    /// poller 描述文件目录
    pub pollers_dir: PathBuf,
    /// JSONL 通知发件箱
    pub outbox_path: PathBuf,
    /// 不轮询的包名
    pub blacklist: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("account-polld");

        Self {
            poll_interval_secs: 300,
            poll_timeout_secs: 30,
            bootstrap_poll_timeout_secs: 240,
            max_penalty: 4,
            helper_max_num: 5,
            helper_max_runtime_secs: 5,
            helper_input_buffer: 10,
            pollers_dir: data_dir.join("pollers"),
            outbox_path: data_dir.join("outbox.jsonl"),
            blacklist: Vec::new(),
        }
    }
}

/// 配置文件格式（所有字段可选）
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    poll_interval_secs: Option<u64>,
    poll_timeout_secs: Option<u64>,
    bootstrap_poll_timeout_secs: Option<u64>,
    max_penalty: Option<u32>,
    helper_max_num: Option<usize>,
    helper_max_runtime_secs: Option<u64>,
    helper_input_buffer: Option<usize>,
    pollers_dir: Option<PathBuf>,
    outbox_path: Option<PathBuf>,
    blacklist: Option<Vec<String>>,
}

impl DaemonConfig {
    /// 默认配置文件路径
    pub fn config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("account-polld")
            .join("config.json")
    }

    /// 按优先级加载完整配置
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::from_file(&Self::config_path())?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// 默认值叠加配置文件，文件不存在时只用默认值
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(config);
        }

        let content = fs::read_to_string(path)?;
        let file: FileConfig = serde_json::from_str(&content)?;
        debug!(path = %path.display(), "Loaded config file");

        if let Some(v) = file.poll_interval_secs {
            config.poll_interval_secs = v;
        }
        if let Some(v) = file.poll_timeout_secs {
            config.poll_timeout_secs = v;
        }
        if let Some(v) = file.bootstrap_poll_timeout_secs {
            config.bootstrap_poll_timeout_secs = v;
        }
        if let Some(v) = file.max_penalty {
            config.max_penalty = v;
        }
        if let Some(v) = file.helper_max_num {
            config.helper_max_num = v;
        }
        if let Some(v) = file.helper_max_runtime_secs {
            config.helper_max_runtime_secs = v;
        }
        if let Some(v) = file.helper_input_buffer {
            config.helper_input_buffer = v;
        }
        if let Some(v) = file.pollers_dir {
            config.pollers_dir = v;
        }
        if let Some(v) = file.outbox_path {
            config.outbox_path = v;
        }
        if let Some(v) = file.blacklist {
            config.blacklist = v;
        }

        Ok(config)
    }

    /// 用环境变量覆盖（`lookup` 便于测试时注入）
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = get("POLL_INTERVAL") {
            self.poll_interval_secs = parse_env("POLL_INTERVAL", &v)?;
        }
        if let Some(v) = get("POLL_TIMEOUT") {
            self.poll_timeout_secs = parse_env("POLL_TIMEOUT", &v)?;
        }
        if let Some(v) = get("BOOTSTRAP_POLL_TIMEOUT") {
            self.bootstrap_poll_timeout_secs = parse_env("BOOTSTRAP_POLL_TIMEOUT", &v)?;
        }
        if let Some(v) = get("MAX_PENALTY") {
            self.max_penalty = parse_env("MAX_PENALTY", &v)?;
        }
        if let Some(v) = get("HELPER_MAX_NUM") {
            self.helper_max_num = parse_env("HELPER_MAX_NUM", &v)?;
        }
        if let Some(v) = get("HELPER_MAX_RUNTIME") {
            self.helper_max_runtime_secs = parse_env("HELPER_MAX_RUNTIME", &v)?;
        }
        if let Some(v) = get("HELPER_INPUT_BUFFER") {
            self.helper_input_buffer = parse_env("HELPER_INPUT_BUFFER", &v)?;
        }
        if let Some(v) = get("POLLERS_DIR") {
            self.pollers_dir = PathBuf::from(v);
        }
        if let Some(v) = get("OUTBOX") {
            self.outbox_path = PathBuf::from(v);
        }

        Ok(())
    }

    /// 必须为正的数值不能是 0
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("poll_interval_secs", self.poll_interval_secs),
            ("poll_timeout_secs", self.poll_timeout_secs),
            ("bootstrap_poll_timeout_secs", self.bootstrap_poll_timeout_secs),
            ("helper_max_num", self.helper_max_num as u64),
            ("helper_max_runtime_secs", self.helper_max_runtime_secs),
            ("helper_input_buffer", self.helper_input_buffer as u64),
        ];

        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            poll_timeout: Duration::from_secs(self.poll_timeout_secs),
            bootstrap_poll_timeout: Duration::from_secs(self.bootstrap_poll_timeout_secs),
            max_penalty: self.max_penalty,
        }
    }

    pub fn helper_pool_config(&self) -> HelperPoolConfig {
        HelperPoolConfig {
            max_num: self.helper_max_num,
            max_runtime: Duration::from_secs(self.helper_max_runtime_secs),
            input_buffer: self.helper_input_buffer,
            temp_dir: None,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: format!("{}{}", ENV_PREFIX, name),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.poll_timeout_secs, 30);
        assert_eq!(config.bootstrap_poll_timeout_secs, 240);
        assert_eq!(config.max_penalty, 4);
        assert_eq!(config.helper_max_num, 5);
        assert_eq!(config.helper_max_runtime_secs, 5);
        assert_eq!(config.helper_input_buffer, 10);
        assert!(config.pollers_dir.ends_with("account-polld/pollers"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::from_file(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, DaemonConfig::default());
    }

    #[test]
    fn test_file_overrides_only_given_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"poll_timeout_secs": 10, "blacklist": ["com.example.mail"]}"#,
        )
        .unwrap();

        let config = DaemonConfig::from_file(&path).unwrap();
        assert_eq!(config.poll_timeout_secs, 10);
        assert_eq!(config.blacklist, vec!["com.example.mail".to_string()]);
        assert_eq!(config.helper_max_num, 5);
    }

    #[test]
    fn test_invalid_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ nope").unwrap();
        assert!(matches!(DaemonConfig::from_file(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_env_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("ACCOUNT_POLLD_POLL_TIMEOUT", "7"),
            ("ACCOUNT_POLLD_HELPER_MAX_NUM", "2"),
            ("ACCOUNT_POLLD_POLLERS_DIR", "/tmp/pollers"),
        ]
        .into_iter()
        .collect();

        let mut config = DaemonConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.poll_timeout_secs, 7);
        assert_eq!(config.helper_max_num, 2);
        assert_eq!(config.pollers_dir, PathBuf::from("/tmp/pollers"));
        assert_eq!(config.poll_settings().poll_timeout, Duration::from_secs(7));
        assert_eq!(config.helper_pool_config().max_num, 2);
    }

    #[test]
    fn test_env_bad_number() {
        let mut config = DaemonConfig::default();
        let err = config
            .apply_env(|k| (k == "ACCOUNT_POLLD_MAX_PENALTY").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("ACCOUNT_POLLD_MAX_PENALTY"));
    }

    #[test]
    fn test_zero_values_rejected() {
        let config = DaemonConfig {
            helper_max_num: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "helper_max_num"
        ));
    }
}
