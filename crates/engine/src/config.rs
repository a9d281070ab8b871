//! Node configuration, read from TOML.
//!
//! ```toml
//! role = "client"
//! actor = "field-laptop-2"
//! database_path = "tracker.db"
//!
//! [sync]
//! interval_ms = 5000
//! probe_timeout_ms = 3000
//! ```

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracker_core::NodeRole;
use tracker_storage::{SqliteStore, StorageError};

/// Host selection probes block the operator, so they stay short.
pub const PROBE_TIMEOUT_RANGE_MS: RangeInclusive<u64> = 1_000..=5_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackerConfig {
    pub role: NodeRole,
    /// Name recorded in history entries written by this node.
    pub actor: String,
    /// On-disk store. In-memory when absent.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,
}

fn default_interval_ms() -> u64 {
    5_000
}

fn default_probe_timeout_ms() -> u64 {
    3_000
}

fn default_notification_capacity() -> usize {
    64
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            notification_capacity: default_notification_capacity(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl TrackerConfig {
    /// Parse and validate.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: TrackerConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.actor.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "actor",
                reason: "must not be empty".to_string(),
            });
        }
        if self.sync.interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync.interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if !PROBE_TIMEOUT_RANGE_MS.contains(&self.sync.probe_timeout_ms) {
            return Err(ConfigError::InvalidValue {
                field: "sync.probe_timeout_ms",
                reason: format!(
                    "must be between {} and {}",
                    PROBE_TIMEOUT_RANGE_MS.start(),
                    PROBE_TIMEOUT_RANGE_MS.end()
                ),
            });
        }
        if self.sync.notification_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync.notification_capacity",
                reason: "must be > 0".to_string(),
            });
        }
        if let Some(path) = &self.database_path {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "database_path",
                    reason: "must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.sync.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.sync.probe_timeout_ms)
    }

    pub fn open_store(&self) -> Result<SqliteStore, StorageError> {
        match &self.database_path {
            Some(path) => SqliteStore::open(path),
            None => SqliteStore::open_in_memory(),
        }
    }
}
