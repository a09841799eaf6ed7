//! Chain event broadcaster for live dashboards.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::chain::JobStatus;

/// What happened to a chain.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChainEventKind {
    StageStarted,
    StageCompleted,
    StageFailed,
    StageTimedOut,
    StageRestarted,
    RootRecomputed,
}

impl std::fmt::Display for ChainEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainEventKind::StageStarted => write!(f, "Stage started"),
            ChainEventKind::StageCompleted => write!(f, "Stage completed"),
            ChainEventKind::StageFailed => write!(f, "Stage failed"),
            ChainEventKind::StageTimedOut => write!(f, "Stage timed out"),
            ChainEventKind::StageRestarted => write!(f, "Stage restarted"),
            ChainEventKind::RootRecomputed => write!(f, "Chain recomputed"),
        }
    }
}

/// A lifecycle change of one stage or of a chain root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainEvent {
    pub kind: ChainEventKind,
    /// Root id; `None` for stages with unresolved linkage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    /// Row the event is about (the root itself for `RootRecomputed`).
    pub job_id: String,
    pub stage_name: String,
    pub status: JobStatus,
    pub progress: u8,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ChainEvent {
    pub fn new(
        kind: ChainEventKind,
        chain_id: Option<&str>,
        job_id: &str,
        stage_name: &str,
        status: JobStatus,
    ) -> Self {
        Self {
            kind,
            chain_id: chain_id.map(str::to_string),
            job_id: job_id.to_string(),
            stage_name: stage_name.to_string(),
            status,
            progress: 0,
            attempt: 1,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_error(mut self, error: Option<&str>) -> Self {
        self.error = error.map(str::to_string);
        self
    }
}

/// Broadcasts chain events to any number of subscribers.
#[derive(Clone)]
pub struct ChainEventBroadcaster {
    sender: Arc<broadcast::Sender<ChainEvent>>,
}

impl ChainEventBroadcaster {
    /// Creates a broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends an event to all subscribers.
    pub fn send(&self, event: ChainEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChainEventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
