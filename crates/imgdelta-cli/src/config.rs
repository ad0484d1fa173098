use imgdelta_runtime::Tools;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_STORE_ROOT: &str = "~/.local/share/imgdelta";
pub const DEFAULT_DRIVER: &str = "overlay2";

/// Contents of `~/.config/imgdelta/config.toml`. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub store: StoreConfig,
    pub tools: Tools,
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub root: Option<String>,
    /// Storage driver the store reports to the engine.
    pub driver: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutConfig {
    /// rsync `--timeout` for batch generation; 0 disables it.
    pub io_timeout_secs: Option<u64>,
    /// Limit on forwarding the batch into rsync during apply.
    pub apply_timeout_secs: Option<u64>,
    /// Limit on rsync exiting once its input has ended.
    pub exit_timeout_secs: Option<u64>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config {}: {e}", path.display()))?;
        toml::from_str(&content).map_err(|e| format!("invalid config {}: {e}", path.display()))
    }

    /// Load `explicit` if given (it must exist), else the default location
    /// when present, else built-in defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self, String> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn store_root(&self, flag: Option<&str>) -> PathBuf {
        let raw = flag
            .or(self.store.root.as_deref())
            .unwrap_or(DEFAULT_STORE_ROOT);
        expand_tilde(raw)
    }

    pub fn driver(&self) -> &str {
        self.store.driver.as_deref().unwrap_or(DEFAULT_DRIVER)
    }

    pub fn io_timeout(&self, flag: Option<u64>) -> Duration {
        Duration::from_secs(flag.or(self.timeouts.io_timeout_secs).unwrap_or(0))
    }

    pub fn apply_timeout(&self, flag: Option<u64>) -> Option<Duration> {
        flag.or(self.timeouts.apply_timeout_secs)
            .map(Duration::from_secs)
    }

    pub fn exit_timeout(&self) -> Option<Duration> {
        self.timeouts.exit_timeout_secs.map(Duration::from_secs)
    }
}

fn default_config_path() -> Option<PathBuf> {
    let home = std::env::var("HOME").ok()?;
    Some(PathBuf::from(home).join(".config/imgdelta/config.toml"))
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
