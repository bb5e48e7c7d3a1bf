use crate::cleanup::CleanupSafeguard;
use crate::errors::{PersistError, PersistResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_WATCH_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_JSON_POLL_INTERVAL_MS: u64 = 3_000;
pub const DEFAULT_WATCH_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    pub data_dir: PathBuf,
    #[serde(default)]
    pub cleanup: CleanupSafeguard,
    /// Re-derive period for simple-mode listeners that do not set their own.
    #[serde(default = "default_watch_interval_ms")]
    pub watch_interval_ms: u64,
    #[serde(default = "default_json_poll_interval_ms")]
    pub json_poll_interval_ms: u64,
    #[serde(default = "default_watch_channel_capacity")]
    pub watch_channel_capacity: usize,
}

impl SyncSettings {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            cleanup: CleanupSafeguard::default(),
            watch_interval_ms: DEFAULT_WATCH_INTERVAL_MS,
            json_poll_interval_ms: DEFAULT_JSON_POLL_INTERVAL_MS,
            watch_channel_capacity: DEFAULT_WATCH_CHANNEL_CAPACITY,
        }
    }

    pub fn load(path: &Path) -> PersistResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let settings = serde_json::from_str::<Self>(&raw).map_err(|error| {
            PersistError::Settings(format!("{}: {}", path.display(), error))
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> PersistResult<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(PersistError::Settings("dataDir must not be empty".to_string()));
        }
        if !(0.0..=1.0).contains(&self.cleanup.min_keep_ratio) {
            return Err(PersistError::Settings(format!(
                "cleanup.minKeepRatio must be within [0, 1], got {}",
                self.cleanup.min_keep_ratio
            )));
        }
        if self.watch_interval_ms == 0 || self.json_poll_interval_ms == 0 {
            return Err(PersistError::Settings(
                "watch intervals must be greater than zero".to_string(),
            ));
        }
        if self.watch_channel_capacity == 0 {
            return Err(PersistError::Settings(
                "watchChannelCapacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }

    pub fn json_poll_interval(&self) -> Duration {
        Duration::from_millis(self.json_poll_interval_ms)
    }
}

fn default_watch_interval_ms() -> u64 {
    DEFAULT_WATCH_INTERVAL_MS
}

fn default_json_poll_interval_ms() -> u64 {
    DEFAULT_JSON_POLL_INTERVAL_MS
}

fn default_watch_channel_capacity() -> usize {
    DEFAULT_WATCH_CHANNEL_CAPACITY
}
