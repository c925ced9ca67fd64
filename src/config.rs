use std::{fs, path::Path, path::PathBuf};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::GpioError;
use crate::gpio::Edge;

pub const DEFAULT_SYSFS_ROOT: &str = "/sys/class/gpio";

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SysfsConfig {
    pub root: PathBuf,
    /// How long to wait for udev to hand out a freshly exported line.
    pub export_timeout_ms: u64,
}

impl Default for SysfsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_SYSFS_ROOT),
            export_timeout_ms: 100,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct WatcherConfig {
    /// Maximum number of readiness events collected per wake.
    pub event_batch: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self { event_batch: 16 }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PinConfig {
    pub name: String,
    #[serde(default)]
    pub edge: Edge,
}

fn default_event_capacity() -> usize {
    64
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub sysfs: SysfsConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    pub pins: FxHashMap<u32, PinConfig>,
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, GpioError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| GpioError::InvalidConfig(format!("Failed to read config: {e}")))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, GpioError> {
        let config: AppConfig = serde_json::from_str(contents)
            .map_err(|e| GpioError::InvalidConfig(format!("Invalid config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), GpioError> {
        if self.watcher.event_batch == 0 {
            return Err(GpioError::InvalidConfig(
                "watcher.event_batch must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
