use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::commands::{RetryPolicy, TimeoutStrategy};
use crate::mirror::MirrorOptions;

pub const ENV_ADB: &str = "DROID_MIRROR_ADB";
pub const ENV_SCRCPY: &str = "DROID_MIRROR_SCRCPY";
pub const ENV_STATE_FILE: &str = "DROID_MIRROR_STATE_FILE";
pub const ENV_WATCH_INTERVAL: &str = "DROID_MIRROR_WATCH_INTERVAL_SECS";

const STATE_FILE_NAME: &str = "devices.state";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchSettings {
    pub interval_secs: u64,
    /// Launch scrcpy for every newly attached device
    pub auto_mirror: bool,
    /// Ask before launching when a terminal is attached
    pub confirm: bool,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            interval_secs: 3,
            auto_mirror: true,
            confirm: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub adb_path: Option<PathBuf>,
    pub scrcpy_path: Option<PathBuf>,
    pub state_file: Option<PathBuf>,
    pub command_timeout_secs: u64,
    pub kill_grace_secs: u64,
    pub retry: RetryPolicy,
    pub watch: WatchSettings,
    pub mirror: MirrorOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            adb_path: None,
            scrcpy_path: None,
            state_file: None,
            command_timeout_secs: 10,
            kill_grace_secs: 2,
            retry: RetryPolicy::default(),
            watch: WatchSettings::default(),
            mirror: MirrorOptions::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let cfg: Config = serde_json::from_str(&raw).context("parsing config JSON")?;
        Ok(cfg)
    }

    /// File settings (when a path is given) with environment overrides on top
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        cfg.apply_overrides(|key| std::env::var(key).ok());
        Ok(cfg)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(adb) = non_empty(ENV_ADB) {
            self.adb_path = Some(PathBuf::from(adb));
        }
        if let Some(scrcpy) = non_empty(ENV_SCRCPY) {
            self.scrcpy_path = Some(PathBuf::from(scrcpy));
        }
        if let Some(state) = non_empty(ENV_STATE_FILE) {
            self.state_file = Some(PathBuf::from(state));
        }
        if let Some(interval) = non_empty(ENV_WATCH_INTERVAL).and_then(|s| s.trim().parse::<u64>().ok()) {
            self.watch.interval_secs = interval;
        }
    }

    pub fn timeout_strategy(&self) -> TimeoutStrategy {
        TimeoutStrategy::new(self.command_timeout_secs, self.kill_grace_secs)
    }

    /// Configured state file, else `<state dir>/droid-mirror/devices.state`
    pub fn state_file(&self) -> PathBuf {
        if let Some(path) = &self.state_file {
            return path.clone();
        }
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(std::env::temp_dir)
            .join("droid-mirror")
            .join(STATE_FILE_NAME)
    }
}
