use std::collections::HashSet;
use std::path::Path;

use crate::config::schema::{TrackerConfig, CONFIG_VERSION};
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

/// Upper bound for any configured duration (one year).
const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<TrackerConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<TrackerConfig, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: TrackerConfig = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

/// Semantic checks the schema cannot express.
pub fn validate_config(config: &TrackerConfig) -> Result<(), ConfigError> {
    if config.version != CONFIG_VERSION {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    let durations = [
        ("stuckThresholdSecs", config.stuck_threshold_secs),
        ("sweepIntervalSecs", config.sweep_interval_secs),
        ("metadataCacheTtlSecs", config.metadata_cache_ttl_secs),
    ];
    for (name, value) in durations {
        check_duration(name, value)?;
    }
    for (stage, value) in &config.stage_timeouts {
        check_duration(&format!("stageTimeouts.{}", stage), *value)?;
    }

    if config.metadata_cache_capacity == 0 {
        return Err(ConfigError::Validation {
            message: "metadataCacheCapacity must be positive".to_string(),
        });
    }
    if config.recompute_max_retries == 0 {
        return Err(ConfigError::Validation {
            message: "recomputeMaxRetries must be positive".to_string(),
        });
    }
    if config.event_channel_capacity == 0 {
        return Err(ConfigError::Validation {
            message: "eventChannelCapacity must be positive".to_string(),
        });
    }

    let mut seen = HashSet::new();
    for stage in &config.stage_order {
        let key = stage.trim().to_lowercase();
        if key.is_empty() {
            return Err(ConfigError::Validation {
                message: "stageOrder entries must not be blank".to_string(),
            });
        }
        if !seen.insert(key) {
            return Err(ConfigError::Validation {
                message: format!("Duplicate stage in stageOrder: {}", stage),
            });
        }
    }

    Ok(())
}

fn check_duration(name: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 || value > MAX_DURATION_SECS {
        return Err(ConfigError::Validation {
            message: format!(
                "{} must be between 1 and {} seconds, got {}",
                name, MAX_DURATION_SECS, value
            ),
        });
    }
    Ok(())
}
