pub mod api;
pub mod broadcast;
pub mod chain;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod tracker;

pub use api::ApiResponse;
pub use broadcast::{ChainEvent, ChainEventBroadcaster, ChainEventKind};
pub use chain::{
    ChainReadModel, ChainRegistry, JobRecord, JobStatus, MetadataStore, QueueSource,
    StageContext, StageInterceptor, StagePayload, StuckStageReaper,
};
pub use config::{load_config, TrackerConfig};
pub use db::{Database, DatabaseError};
pub use error::{
    ChainError, ChaintrackError, ConfigError, LoggingError, MetadataError, QueueError, Result,
    StageError,
};
pub use logging::{init_logging, LogFormat};
pub use tracker::{new_chain_id, ChainTracker, ReaperHandle};
