//! Serialized root recomputation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::broadcast::{ChainEvent, ChainEventBroadcaster, ChainEventKind};
use crate::chain::calculator::{calculate, RootAggregate};
use crate::chain::record::JobRecord;
use crate::chain::registry::ChainRegistry;
use crate::error::ChainError;

/// Default number of optimistic write attempts before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// One mutex per root id, created on demand.
#[derive(Default)]
pub struct RootLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RootLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` while holding the lock for `root_id`.
    pub fn with_lock<T>(&self, root_id: &str, f: impl FnOnce() -> T) -> T {
        let lock = {
            let mut locks = lock_recovering(&self.locks);
            Arc::clone(locks.entry(root_id.to_string()).or_default())
        };

        let result = {
            let _guard = lock_recovering(&lock);
            f()
        };

        // Drop the entry once nobody else is waiting on it.
        let mut locks = lock_recovering(&self.locks);
        if Arc::strong_count(&lock) == 2 {
            locks.remove(root_id);
        }
        result
    }

    pub fn len(&self) -> usize {
        lock_recovering(&self.locks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock_recovering<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        log::warn!("Root lock was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Recomputes root rows after child mutations.
///
/// In-process callers are serialized per root by [`RootLocks`]; writers in
/// other processes are detected through the root's `version` column and the
/// read-compute-write cycle is retried.
#[derive(Clone)]
pub struct RootRecomputer {
    registry: ChainRegistry,
    locks: Arc<RootLocks>,
    max_retries: u32,
    events: Option<ChainEventBroadcaster>,
}

impl RootRecomputer {
    pub fn new(registry: ChainRegistry) -> Self {
        Self {
            registry,
            locks: Arc::new(RootLocks::new()),
            max_retries: DEFAULT_MAX_RETRIES,
            events: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_events(mut self, events: ChainEventBroadcaster) -> Self {
        self.events = Some(events);
        self
    }

    pub fn registry(&self) -> &ChainRegistry {
        &self.registry
    }

    /// Recomputes and persists the aggregate of `root_id`, returning the root
    /// as stored afterwards.
    pub fn recompute(&self, root_id: &str, now: DateTime<Utc>) -> Result<JobRecord, ChainError> {
        self.locks
            .with_lock(root_id, || self.recompute_locked(root_id, now))
    }

    fn recompute_locked(&self, root_id: &str, now: DateTime<Utc>) -> Result<JobRecord, ChainError> {
        for attempt in 1..=self.max_retries {
            let mut root = match self.registry.find_by_id(root_id)? {
                Some(record) if record.is_root() => record,
                _ => return Err(ChainError::RootNotFound(root_id.to_string())),
            };
            let children = self.registry.children_of(root_id)?;
            let aggregate = calculate(&root, &children, now);

            if aggregate.matches(&root) {
                return Ok(root);
            }

            let expected_version = root.version;
            aggregate.apply_to(&mut root);
            root.updated_at = now;

            if self.registry.write_root_aggregate(&root, expected_version)? {
                root.version = expected_version + 1;
                self.publish(&root, &aggregate);
                log::debug!(
                    "Recomputed chain {}: {} at {}% ({}/{} stages)",
                    root_id,
                    root.status,
                    root.progress,
                    aggregate.completed_stages,
                    aggregate.total_stages
                );
                return Ok(root);
            }

            log::debug!(
                "Chain {} changed during recomputation (attempt {}/{}), retrying",
                root_id,
                attempt,
                self.max_retries
            );
        }

        log::warn!(
            "Giving up recomputing chain {} after {} attempts",
            root_id,
            self.max_retries
        );
        Err(ChainError::RecomputeConflict {
            root_id: root_id.to_string(),
            attempts: self.max_retries,
        })
    }

    fn publish(&self, root: &JobRecord, aggregate: &RootAggregate) {
        if let Some(events) = &self.events {
            events.send(
                ChainEvent::new(
                    ChainEventKind::RootRecomputed,
                    Some(&root.id),
                    &root.id,
                    &root.stage_name,
                    aggregate.status,
                )
                .with_progress(aggregate.progress)
                .with_attempt(root.attempt)
                .with_error(aggregate.exception.as_deref()),
            );
        }
    }
}
