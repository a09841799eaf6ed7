//! Chain lifecycle tracking: registry, aggregation, interception, reaping
//! and the read model built on top of them.

pub mod calculator;
pub mod identity;
pub mod interceptor;
pub mod metadata;
pub mod order;
pub mod pending;
pub mod read_model;
pub mod reaper;
pub mod recompute;
pub mod record;
pub mod registry;

pub use calculator::{calculate, effective_children, FailedStage, RootAggregate};
pub use identity::{IdentityResolver, Resolution, ResolvedIdentity, StageContext, StagePayload};
pub use interceptor::{StageHandle, StageInterceptor, StageScope};
pub use metadata::MetadataStore;
pub use order::{ChainOrderResolver, DEFAULT_STAGE_ORDER, UNKNOWN_ORDER};
pub use pending::{
    MemoryQueue, PendingStageInspector, PendingStageView, QueueSource, QueuedUnit, UNGROUPED_KEY,
};
pub use read_model::{
    ChainListResponse, ChainQueryParams, ChainReadModel, ChainStatistics, ChainSummary, ChainView,
    StepView,
};
pub use reaper::{ReaperScheduler, StuckStageReaper, SweepReport, TimeoutPolicy, TIMEOUT_EXCEPTION};
pub use recompute::{RootLocks, RootRecomputer};
pub use record::{JobRecord, JobStatus};
pub use registry::{
    ChainRegistry, JobUpsert, NewRoot, StageOutcome, StageRef, Transition, TransitionOutcome,
};
