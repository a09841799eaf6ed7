//! Builders for creating test data programmatically.

#![allow(dead_code)]

use serde_json::Value;

use chaintrack::{StageContext, StagePayload, TrackerConfig};

/// Builder for creating `TrackerConfig` instances.
pub struct ConfigBuilder {
    config: TrackerConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: TrackerConfig::default(),
        }
    }

    pub fn stuck_threshold_secs(mut self, secs: u64) -> Self {
        self.config.stuck_threshold_secs = secs;
        self
    }

    pub fn stage_timeout(mut self, stage: &str, secs: u64) -> Self {
        self.config.stage_timeouts.insert(stage.to_string(), secs);
        self
    }

    pub fn sweep_interval_secs(mut self, secs: u64) -> Self {
        self.config.sweep_interval_secs = secs;
        self
    }

    pub fn stage_order(mut self, stages: &[&str]) -> Self {
        self.config.stage_order = stages.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn build(self) -> TrackerConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Payload carrying an explicit stage context.
pub fn stage_payload(unit_id: &str, chain_id: &str, stage_name: &str) -> StagePayload {
    StagePayload::new(
        unit_id,
        StageContext {
            chain_id: chain_id.to_string(),
            stage_name: stage_name.to_string(),
        },
    )
    .with_queue("documents")
}

/// Payload without a context; identity must be recovered from `body`.
pub fn legacy_payload(unit_id: &str, display_name: Option<&str>, body: Value) -> StagePayload {
    StagePayload {
        unit_id: unit_id.to_string(),
        queue: None,
        display_name: display_name.map(str::to_string),
        context: None,
        body,
    }
}
