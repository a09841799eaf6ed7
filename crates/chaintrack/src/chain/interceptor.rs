//! Stage execution wrapper.
//!
//! [`StageInterceptor::run`] decorates a stage body: it records the start,
//! runs the body, records the outcome and recomputes the owning root. It
//! knows nothing about the queue runtime that called it.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info_span, warn};

use crate::broadcast::{ChainEvent, ChainEventBroadcaster, ChainEventKind};
use crate::chain::identity::{IdentityResolver, Resolution, StagePayload};
use crate::chain::metadata::MetadataStore;
use crate::chain::recompute::RootRecomputer;
use crate::chain::registry::{
    ChainRegistry, NewRoot, StageOutcome, StageRef, Transition, TransitionOutcome, DEFAULT_QUEUE,
};
use crate::error::{ChainError, StageError};

/// A started stage attempt, returned by [`StageInterceptor::before`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageHandle {
    pub stage: StageRef,
    pub attempt: u32,
    pub resolution: Resolution,
}

impl StageHandle {
    pub fn chain_id(&self) -> Option<&str> {
        self.stage.parent_id.as_deref()
    }
}

/// What a stage body sees while it runs.
pub struct StageScope<'a> {
    handle: &'a StageHandle,
    metadata: &'a MetadataStore,
}

impl StageScope<'_> {
    pub fn handle(&self) -> &StageHandle {
        self.handle
    }

    pub fn chain_id(&self) -> Option<&str> {
        self.handle.chain_id()
    }

    pub fn stage_name(&self) -> &str {
        &self.handle.stage.stage_name
    }

    pub fn attempt(&self) -> u32 {
        self.handle.attempt
    }

    /// Metadata written by upstream stages. Absence fails the stage.
    pub fn require_metadata(&self) -> Result<Value, StageError> {
        let chain_id = self.chain_id().ok_or(StageError::Unlinked)?;
        Ok(self.metadata.require(chain_id)?)
    }

    pub fn retrieve_metadata(&self) -> Result<Option<Value>, StageError> {
        let chain_id = self.chain_id().ok_or(StageError::Unlinked)?;
        Ok(self.metadata.retrieve(chain_id)?)
    }

    /// Publishes metadata for downstream stages.
    pub fn store_metadata(&self, metadata: &Value) -> Result<(), StageError> {
        let chain_id = self.chain_id().ok_or(StageError::Unlinked)?;
        Ok(self.metadata.store(chain_id, metadata)?)
    }
}

#[derive(Clone)]
pub struct StageInterceptor {
    registry: ChainRegistry,
    recomputer: RootRecomputer,
    metadata: MetadataStore,
    resolver: IdentityResolver,
    events: ChainEventBroadcaster,
}

impl StageInterceptor {
    pub fn new(
        registry: ChainRegistry,
        recomputer: RootRecomputer,
        metadata: MetadataStore,
        events: ChainEventBroadcaster,
    ) -> Self {
        Self {
            registry,
            recomputer,
            metadata,
            resolver: IdentityResolver::new(),
            events,
        }
    }

    /// Runs `stage` wrapped in lifecycle bookkeeping.
    ///
    /// A stage error is recorded on the stage row before it is returned as
    /// [`ChainError::Stage`].
    pub fn run<T, F>(&self, payload: &StagePayload, stage: F) -> Result<T, ChainError>
    where
        F: FnOnce(&StageScope<'_>) -> Result<T, StageError>,
    {
        let handle = self.before(payload, Utc::now())?;
        let _span = info_span!("stage",
            unit_id = %handle.stage.id,
            stage_name = %handle.stage.stage_name,
            chain_id = handle.chain_id().unwrap_or("unresolved"),
            attempt = handle.attempt,
        )
        .entered();

        let scope = StageScope {
            handle: &handle,
            metadata: &self.metadata,
        };
        match stage(&scope) {
            Ok(value) => {
                self.after_success(&handle, Utc::now())?;
                Ok(value)
            }
            Err(source) => {
                self.after_failure(&handle, &source.to_string(), Utc::now())?;
                Err(ChainError::Stage {
                    stage_name: handle.stage.stage_name.clone(),
                    source,
                })
            }
        }
    }

    /// Records the start of a stage attempt.
    pub fn before(&self, payload: &StagePayload, now: DateTime<Utc>) -> Result<StageHandle, ChainError> {
        let identity = self.resolver.resolve(payload);
        let queue = identity
            .queue
            .clone()
            .unwrap_or_else(|| DEFAULT_QUEUE.to_string());

        let parent_id = match identity.chain_id.as_deref() {
            Some(chain_id) => self.ensure_root(chain_id, &queue, now)?,
            None => None,
        };
        let resolution = match (&parent_id, identity.resolution) {
            (None, _) => Resolution::Unresolved,
            (Some(_), resolution) => resolution,
        };

        let stage = StageRef {
            id: identity.unit_id,
            linkage_unresolved: parent_id.is_none(),
            parent_id,
            stage_name: identity.stage_name,
            queue,
        };
        let record = self.registry.start_stage(&stage, now)?;
        debug!(
            "Stage {} ({}) started, attempt {}",
            stage.id, stage.stage_name, record.attempt
        );

        self.events.send(
            ChainEvent::new(
                ChainEventKind::StageStarted,
                stage.parent_id.as_deref(),
                &stage.id,
                &stage.stage_name,
                record.status,
            )
            .with_attempt(record.attempt),
        );

        if let Some(root_id) = stage.parent_id.as_deref() {
            self.recomputer.recompute(root_id, now)?;
        }

        Ok(StageHandle {
            stage,
            attempt: record.attempt,
            resolution,
        })
    }

    pub fn after_success(&self, handle: &StageHandle, now: DateTime<Utc>) -> Result<Transition, ChainError> {
        self.finish(handle, &StageOutcome::Completed, now)
    }

    pub fn after_failure(
        &self,
        handle: &StageHandle,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition, ChainError> {
        self.finish(
            handle,
            &StageOutcome::Failed {
                message: message.to_string(),
            },
            now,
        )
    }

    fn finish(
        &self,
        handle: &StageHandle,
        outcome: &StageOutcome,
        now: DateTime<Utc>,
    ) -> Result<Transition, ChainError> {
        let transition = self
            .registry
            .finish_stage(&handle.stage, handle.attempt, outcome, now)?;
        if transition.outcome != TransitionOutcome::Applied {
            return Ok(transition);
        }

        let record = &transition.record;
        let kind = match outcome {
            StageOutcome::Completed => ChainEventKind::StageCompleted,
            StageOutcome::Failed { .. } => ChainEventKind::StageFailed,
        };
        self.events.send(
            ChainEvent::new(
                kind,
                handle.chain_id(),
                &record.id,
                &record.stage_name,
                record.status,
            )
            .with_progress(record.progress)
            .with_attempt(record.attempt)
            .with_error(record.exception.as_deref()),
        );

        if let Some(root_id) = handle.chain_id() {
            self.recomputer.recompute(root_id, now)?;
        }
        Ok(transition)
    }

    /// Makes sure `chain_id` names a root row, creating it with the chain's
    /// current metadata if needed. Returns the parent id to record, or `None`
    /// if `chain_id` belongs to a non-root row.
    fn ensure_root(
        &self,
        chain_id: &str,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, ChainError> {
        match self.registry.find_by_id(chain_id)? {
            Some(existing) if existing.is_root() => return Ok(Some(existing.id)),
            Some(_) => {
                warn!(
                    "Chain id {} refers to a stage row, recording stage without linkage",
                    chain_id
                );
                return Ok(None);
            }
            None => {}
        }

        let root = NewRoot {
            id: chain_id.to_string(),
            queue: Some(queue.to_string()),
            metadata: self.metadata.retrieve(chain_id)?,
            ..Default::default()
        };
        self.registry.ensure_root(&root, now)?;
        Ok(Some(chain_id.to_string()))
    }
}
