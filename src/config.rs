// src/config.rs

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

/// Tunables for the install engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Where the engine keeps its state.
    pub db_path: PathBuf,
    /// Simulated length of one install, identical for every item.
    pub total_duration: Duration,
    /// How often an active install recomputes its progress.
    pub tick_interval: Duration,
    /// Minimum gap between saves triggered by progress ticks.
    pub persist_interval: Duration,
    /// Throttle window for progress events aimed at focused/detail views.
    pub fast_cadence: Duration,
    /// Throttle window for progress events aimed at list views.
    pub slow_cadence: Duration,
    /// Buffer size of each event channel.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("installs.db"),
            total_duration: Duration::from_secs(30),
            tick_interval: Duration::from_millis(100),
            persist_interval: Duration::from_secs(5),
            fast_cadence: Duration::from_millis(100),
            slow_cadence: Duration::from_millis(200),
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Reads a JSON config file. Missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.total_duration.is_zero() {
            return Err(ConfigError::ZeroDuration("total_duration"));
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("tick_interval"));
        }
        Ok(())
    }

    pub fn total_secs(&self) -> f64 {
        self.total_duration.as_secs_f64()
    }
}
