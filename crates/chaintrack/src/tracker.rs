//! Assembles the chain components from a [`TrackerConfig`].

use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::broadcast::ChainEventBroadcaster;
use crate::chain::{
    ChainOrderResolver, ChainReadModel, ChainRegistry, MemoryQueue, MetadataStore, NewRoot,
    PendingStageInspector, QueueSource, ReaperScheduler, RootRecomputer, StageInterceptor,
    StagePayload, StageScope, StuckStageReaper,
};
use crate::config::TrackerConfig;
use crate::db::Database;
use crate::error::{ChainError, ChaintrackError, StageError};

/// Generates a fresh chain id for a new submission.
pub fn new_chain_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Clone)]
pub struct ChainTracker {
    config: TrackerConfig,
    registry: ChainRegistry,
    recomputer: RootRecomputer,
    metadata: MetadataStore,
    interceptor: StageInterceptor,
    reaper: Arc<StuckStageReaper>,
    read_model: ChainReadModel,
    events: ChainEventBroadcaster,
}

impl ChainTracker {
    /// Opens the configured database and builds a tracker with an empty
    /// in-process queue.
    pub fn from_config(config: &TrackerConfig) -> Result<Self, ChaintrackError> {
        let path = config.resolved_database_path()?;
        let db = Database::open(&path)?;
        Ok(Self::open(db, config))
    }

    pub fn open(db: Database, config: &TrackerConfig) -> Self {
        Self::with_queue(db, config, Arc::new(MemoryQueue::new()))
    }

    /// Builds a tracker reading unclaimed work from `queue`.
    pub fn with_queue(db: Database, config: &TrackerConfig, queue: Arc<dyn QueueSource>) -> Self {
        let events = ChainEventBroadcaster::new(config.event_channel_capacity);
        let order = Arc::new(ChainOrderResolver::new(&config.stage_order));
        let registry = ChainRegistry::new(db.clone(), order);
        let recomputer = RootRecomputer::new(registry.clone())
            .with_max_retries(config.recompute_max_retries)
            .with_events(events.clone());
        let metadata = MetadataStore::with_cache(
            db,
            config.metadata_cache_capacity,
            config.metadata_cache_ttl(),
        );
        let interceptor = StageInterceptor::new(
            registry.clone(),
            recomputer.clone(),
            metadata.clone(),
            events.clone(),
        );
        let reaper = StuckStageReaper::new(
            registry.clone(),
            recomputer.clone(),
            config.timeout_policy(),
        )
        .with_events(events.clone());
        let pending = PendingStageInspector::new(registry.clone(), queue);
        let read_model = ChainReadModel::new(registry.clone(), recomputer.clone(), pending)
            .with_events(events.clone());

        Self {
            config: config.clone(),
            registry,
            recomputer,
            metadata,
            interceptor,
            reaper: Arc::new(reaper),
            read_model,
            events,
        }
    }

    /// Registers a chain at submission time.
    ///
    /// `metadata` is stored before the root is created so that the root's
    /// snapshot and the first stage see the same context. Returns `true` if
    /// this call created the root.
    pub fn register_chain(
        &self,
        root_id: &str,
        stages: &[&str],
        metadata: Option<&Value>,
    ) -> Result<bool, ChainError> {
        self.register_chain_at(root_id, stages, metadata, Utc::now())
    }

    pub fn register_chain_at(
        &self,
        root_id: &str,
        stages: &[&str],
        metadata: Option<&Value>,
        now: DateTime<Utc>,
    ) -> Result<bool, ChainError> {
        if let Some(metadata) = metadata {
            self.metadata.store_at(root_id, metadata, now)?;
        }
        let created = self.registry.ensure_root(
            &NewRoot {
                id: root_id.to_string(),
                metadata: metadata.cloned(),
                expected_stages: stages.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
            now,
        )?;
        Ok(created)
    }

    /// Runs one stage body through the interceptor.
    pub fn run_stage<T, F>(&self, payload: &StagePayload, stage: F) -> Result<T, ChainError>
    where
        F: FnOnce(&StageScope<'_>) -> Result<T, StageError>,
    {
        self.interceptor.run(payload, stage)
    }

    /// Starts the periodic reaper sweep on a background thread.
    pub fn start_reaper(&self) -> ReaperHandle {
        let scheduler = ReaperScheduler::new(Arc::clone(&self.reaper), self.config.sweep_interval());
        let (trigger, trigger_rx) = broadcast::channel(4);
        let join = scheduler.start(trigger_rx);
        log::info!(
            "Reaper started (interval {}s, threshold {}s)",
            self.config.sweep_interval_secs,
            self.config.stuck_threshold_secs
        );
        ReaperHandle {
            scheduler,
            trigger,
            join,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn registry(&self) -> &ChainRegistry {
        &self.registry
    }

    pub fn recomputer(&self) -> &RootRecomputer {
        &self.recomputer
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn interceptor(&self) -> &StageInterceptor {
        &self.interceptor
    }

    pub fn reaper(&self) -> &StuckStageReaper {
        &self.reaper
    }

    pub fn read_model(&self) -> &ChainReadModel {
        &self.read_model
    }

    pub fn events(&self) -> &ChainEventBroadcaster {
        &self.events
    }
}

/// Running reaper scheduler.
pub struct ReaperHandle {
    scheduler: ReaperScheduler,
    trigger: broadcast::Sender<()>,
    join: JoinHandle<()>,
}

impl ReaperHandle {
    /// Requests an immediate sweep.
    pub fn trigger(&self) {
        if self.trigger.send(()).is_err() {
            log::warn!("Reaper is not running, sweep trigger dropped");
        }
    }

    /// Stops the scheduler and waits for its thread to exit.
    pub fn shutdown(self) {
        self.scheduler.stop();
        let _ = self.trigger.send(());
        if self.join.join().is_err() {
            log::error!("Reaper thread panicked");
        }
    }
}
