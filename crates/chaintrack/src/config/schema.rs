use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chain::metadata::{DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL};
use crate::chain::order::DEFAULT_STAGE_ORDER;
use crate::chain::reaper::{secs, TimeoutPolicy, DEFAULT_STUCK_THRESHOLD_SECS};
use crate::chain::recompute::DEFAULT_MAX_RETRIES;
use crate::db::default_database_path;
use crate::error::ConfigError;
use crate::logging::LogFormat;

pub const CONFIG_VERSION: &str = "1.0";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackerConfig {
    pub version: String,
    /// SQLite file shared by every process of the deployment.
    /// Defaults to `~/.chaintrack/data/chaintrack.db`.
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default = "default_stuck_threshold")]
    pub stuck_threshold_secs: u64,
    /// Per-stage overrides of `stuckThresholdSecs`, keyed by stage name.
    #[serde(default)]
    pub stage_timeouts: BTreeMap<String, u64>,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_cache_ttl")]
    pub metadata_cache_ttl_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub metadata_cache_capacity: u64,
    #[serde(default = "default_max_retries")]
    pub recompute_max_retries: u32,
    #[serde(default = "default_stage_order")]
    pub stage_order: Vec<String>,
    #[serde(default = "default_event_capacity")]
    pub event_channel_capacity: usize,
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_stuck_threshold() -> u64 {
    DEFAULT_STUCK_THRESHOLD_SECS
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_cache_ttl() -> u64 {
    DEFAULT_CACHE_TTL.as_secs()
}

fn default_cache_capacity() -> u64 {
    DEFAULT_CACHE_CAPACITY
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_stage_order() -> Vec<String> {
    DEFAULT_STAGE_ORDER.iter().map(|s| s.to_string()).collect()
}

fn default_event_capacity() -> usize {
    256
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION.to_string(),
            database_path: None,
            stuck_threshold_secs: default_stuck_threshold(),
            stage_timeouts: BTreeMap::new(),
            sweep_interval_secs: default_sweep_interval(),
            metadata_cache_ttl_secs: default_cache_ttl(),
            metadata_cache_capacity: default_cache_capacity(),
            recompute_max_retries: default_max_retries(),
            stage_order: default_stage_order(),
            event_channel_capacity: default_event_capacity(),
            log_format: LogFormat::default(),
        }
    }
}

impl TrackerConfig {
    /// Configured database path, or the per-user default.
    pub fn resolved_database_path(&self) -> Result<PathBuf, ConfigError> {
        match self.database_path.as_deref() {
            Some(path) => Ok(PathBuf::from(path)),
            None => default_database_path().ok_or(ConfigError::NoDatabasePath),
        }
    }

    pub fn timeout_policy(&self) -> TimeoutPolicy {
        self.stage_timeouts.iter().fold(
            TimeoutPolicy::from_secs(self.stuck_threshold_secs),
            |policy, (stage, timeout)| policy.with_override(stage, secs(*timeout)),
        )
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn metadata_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.metadata_cache_ttl_secs)
    }
}
