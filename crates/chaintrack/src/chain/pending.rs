//! Best-effort view of queued stage work that no worker has claimed yet.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::chain::identity::{IdentityResolver, Resolution, StagePayload};
use crate::chain::record::JobStatus;
use crate::chain::registry::{ChainRegistry, DEFAULT_QUEUE};
use crate::error::{ChainError, QueueError};

/// Group key for units whose chain could not be recovered.
pub const UNGROUPED_KEY: &str = "ungrouped";

/// A unit of work sitting in the external queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedUnit {
    pub payload: StagePayload,
    /// Times the runtime has already handed this unit out.
    pub attempts: u32,
    /// Claimed by a worker that has not reported a start yet.
    pub reserved: bool,
}

impl QueuedUnit {
    pub fn new(payload: StagePayload) -> Self {
        Self {
            payload,
            attempts: 0,
            reserved: false,
        }
    }
}

/// Read access to the queue runtime's backlog.
pub trait QueueSource: Send + Sync {
    fn queued_units(&self) -> Result<Vec<QueuedUnit>, QueueError>;
}

/// In-process queue backlog.
#[derive(Default)]
pub struct MemoryQueue {
    units: Mutex<Vec<QueuedUnit>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_units(&self) -> MutexGuard<'_, Vec<QueuedUnit>> {
        self.units.lock().unwrap_or_else(|poisoned| {
            log::warn!("Memory queue lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn push(&self, payload: StagePayload) {
        self.lock_units().push(QueuedUnit::new(payload));
    }

    /// Marks the unit as handed to a worker. Returns `false` if it is not queued.
    pub fn reserve(&self, unit_id: &str) -> bool {
        let mut units = self.lock_units();
        match units.iter_mut().find(|u| u.payload.unit_id == unit_id) {
            Some(unit) => {
                unit.reserved = true;
                unit.attempts += 1;
                true
            }
            None => false,
        }
    }

    /// Puts a reserved unit back for another attempt.
    pub fn release(&self, unit_id: &str) {
        if let Some(unit) = self
            .lock_units()
            .iter_mut()
            .find(|u| u.payload.unit_id == unit_id)
        {
            unit.reserved = false;
        }
    }

    pub fn remove(&self, unit_id: &str) -> Option<QueuedUnit> {
        let mut units = self.lock_units();
        let index = units.iter().position(|u| u.payload.unit_id == unit_id)?;
        Some(units.remove(index))
    }

    pub fn len(&self) -> usize {
        self.lock_units().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl QueueSource for MemoryQueue {
    fn queued_units(&self) -> Result<Vec<QueuedUnit>, QueueError> {
        Ok(self.lock_units().clone())
    }
}

/// Transient, never persisted view of one unclaimed unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingStageView {
    pub id: String,
    pub parent_id: Option<String>,
    pub stage_name: String,
    pub status: JobStatus,
    pub queue: String,
    pub attempt: u32,
    pub resolution: Resolution,
}

#[derive(Clone)]
pub struct PendingStageInspector {
    registry: ChainRegistry,
    resolver: IdentityResolver,
    source: Arc<dyn QueueSource>,
}

impl PendingStageInspector {
    pub fn new(registry: ChainRegistry, source: Arc<dyn QueueSource>) -> Self {
        Self {
            registry,
            resolver: IdentityResolver::new(),
            source,
        }
    }

    /// Views of every queued unit without a registry row.
    pub fn inspect(&self) -> Result<Vec<PendingStageView>, ChainError> {
        let mut views = Vec::new();
        for unit in self.source.queued_units()? {
            if self.registry.find_by_id(&unit.payload.unit_id)?.is_some() {
                continue;
            }
            let identity = self.resolver.resolve(&unit.payload);
            views.push(PendingStageView {
                id: identity.unit_id,
                parent_id: identity.chain_id,
                stage_name: identity.stage_name,
                status: if unit.reserved {
                    JobStatus::Processing
                } else {
                    JobStatus::Pending
                },
                queue: identity
                    .queue
                    .unwrap_or_else(|| DEFAULT_QUEUE.to_string()),
                attempt: unit.attempts.max(1),
                resolution: identity.resolution,
            });
        }
        Ok(views)
    }

    /// Unclaimed units keyed by chain id, or [`UNGROUPED_KEY`].
    pub fn grouped(&self) -> Result<BTreeMap<String, Vec<PendingStageView>>, ChainError> {
        let mut groups: BTreeMap<String, Vec<PendingStageView>> = BTreeMap::new();
        for view in self.inspect()? {
            let key = view
                .parent_id
                .clone()
                .unwrap_or_else(|| UNGROUPED_KEY.to_string());
            groups.entry(key).or_default().push(view);
        }
        Ok(groups)
    }

    pub fn unclaimed_count(&self) -> Result<usize, ChainError> {
        Ok(self.inspect()?.len())
    }
}
