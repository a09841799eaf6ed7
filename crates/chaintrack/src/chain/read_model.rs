//! Read model for dashboards and API clients.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::broadcast::{ChainEvent, ChainEventBroadcaster, ChainEventKind};
use crate::chain::calculator::{calculate, effective_children};
use crate::chain::pending::{PendingStageInspector, PendingStageView};
use crate::chain::record::{format_timestamp, JobRecord, JobStatus};
use crate::chain::recompute::RootRecomputer;
use crate::chain::registry::ChainRegistry;
use crate::db::job_repo::RootFilter;
use crate::error::ChainError;

/// One stage of a chain, deduplicated to its effective row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepView {
    pub id: String,
    pub stage_name: String,
    pub status: JobStatus,
    /// Milliseconds between start and finish, once both are known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    pub order: i64,
    pub queue: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepView {
    fn from_record(record: &JobRecord) -> Self {
        let duration_ms = match (record.started_at, record.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0)),
            _ => None,
        };
        Self {
            id: record.id.clone(),
            stage_name: record.stage_name.clone(),
            status: record.status,
            duration_ms,
            attempt: record.attempt,
            exception: record.exception.clone(),
            order: record.order_in_chain,
            queue: record.queue.clone(),
            started_at: record.started_at,
            finished_at: record.finished_at,
        }
    }
}

/// Aggregate view of one chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainView {
    pub id: String,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    pub completed_stages: usize,
    pub total_stages: usize,
    pub steps: Vec<StepView>,
    /// Units of this chain still waiting in the queue.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub queued: Vec<PendingStageView>,
    pub created_at: DateTime<Utc>,
}

/// Root counts by status. `pending` includes unclaimed queued units.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainStatistics {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    /// Unclaimed queued units on their own.
    pub queued: u64,
}

/// Filters for [`ChainReadModel::list_chains`].
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainQueryParams {
    pub status: Option<String>,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// One row of a chain listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainSummary {
    pub id: String,
    pub stage_name: String,
    pub status: JobStatus,
    pub progress: u8,
    pub queue: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<JobRecord> for ChainSummary {
    fn from(root: JobRecord) -> Self {
        Self {
            id: root.id,
            stage_name: root.stage_name,
            status: root.status,
            progress: root.progress,
            queue: root.queue,
            exception: root.exception,
            created_at: root.created_at,
            started_at: root.started_at,
            finished_at: root.finished_at,
        }
    }
}

/// Response for chain listing with pagination.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainListResponse {
    pub chains: Vec<ChainSummary>,
    pub total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

#[derive(Clone)]
pub struct ChainReadModel {
    registry: ChainRegistry,
    recomputer: RootRecomputer,
    pending: PendingStageInspector,
    events: Option<ChainEventBroadcaster>,
}

impl ChainReadModel {
    pub fn new(
        registry: ChainRegistry,
        recomputer: RootRecomputer,
        pending: PendingStageInspector,
    ) -> Self {
        Self {
            registry,
            recomputer,
            pending,
            events: None,
        }
    }

    pub fn with_events(mut self, events: ChainEventBroadcaster) -> Self {
        self.events = Some(events);
        self
    }

    fn load_root(&self, chain_id: &str) -> Result<JobRecord, ChainError> {
        match self.registry.find_by_id(chain_id)? {
            Some(root) if root.is_root() => Ok(root),
            _ => Err(ChainError::RootNotFound(chain_id.to_string())),
        }
    }

    pub fn get_chain(&self, chain_id: &str) -> Result<ChainView, ChainError> {
        let root = self.load_root(chain_id)?;
        let children = self.registry.children_of(chain_id)?;
        // Only the stage counts are taken from here; status and progress
        // are the stored, already recomputed values.
        let aggregate = calculate(&root, &children, Utc::now());
        let steps = effective_children(&children)
            .into_iter()
            .map(StepView::from_record)
            .collect();
        let queued = self
            .pending
            .grouped()?
            .remove(chain_id)
            .unwrap_or_default();

        Ok(ChainView {
            id: root.id,
            status: root.status,
            progress: root.progress,
            started_at: root.started_at,
            finished_at: root.finished_at,
            exception: root.exception,
            completed_stages: aggregate.completed_stages,
            total_stages: aggregate.total_stages,
            steps,
            queued,
            created_at: root.created_at,
        })
    }

    pub fn get_statistics(&self) -> Result<ChainStatistics, ChainError> {
        let queued = self.pending.unclaimed_count()? as u64;
        Ok(ChainStatistics {
            pending: self.registry.count_roots_by_status(JobStatus::Pending)? + queued,
            processing: self.registry.count_roots_by_status(JobStatus::Processing)?,
            completed: self.registry.count_roots_by_status(JobStatus::Completed)?,
            failed: self.registry.count_roots_by_status(JobStatus::Failed)?,
            queued,
        })
    }

    pub fn pending_grouped(&self) -> Result<BTreeMap<String, Vec<PendingStageView>>, ChainError> {
        self.pending.grouped()
    }

    pub fn list_chains(&self, params: &ChainQueryParams) -> Result<ChainListResponse, ChainError> {
        if let Some(status) = params.status.as_deref() {
            status
                .parse::<JobStatus>()
                .map_err(|s| ChainError::InvalidQuery(format!("unknown status '{}'", s)))?;
        }
        let filter = RootFilter {
            status: params.status.clone(),
            from_date: normalize_date(params.from_date.as_deref())?,
            to_date: normalize_date(params.to_date.as_deref())?,
            limit: params.limit,
            offset: params.offset,
        };
        let (roots, total) = self.registry.roots_where(&filter)?;
        Ok(ChainListResponse {
            chains: roots.into_iter().map(ChainSummary::from).collect(),
            total,
            limit: params.limit,
            offset: params.offset,
        })
    }

    /// Resets the effective failed row of `stage_name` to pending and
    /// recomputes the chain. The worker runtime is responsible for
    /// dispatching the stage again.
    pub fn restart_stage(
        &self,
        chain_id: &str,
        stage_name: &str,
        now: DateTime<Utc>,
    ) -> Result<ChainView, ChainError> {
        self.load_root(chain_id)?;
        let children = self.registry.children_of(chain_id)?;
        let wanted = stage_name.trim();
        let target = effective_children(&children)
            .into_iter()
            .find(|r| r.stage_name.trim().eq_ignore_ascii_case(wanted))
            .cloned()
            .ok_or_else(|| ChainError::StageNotFound {
                chain_id: chain_id.to_string(),
                stage_name: stage_name.to_string(),
            })?;

        let not_restartable = |status: JobStatus| ChainError::NotRestartable {
            chain_id: chain_id.to_string(),
            stage_name: target.stage_name.clone(),
            status: status.to_string(),
        };
        if target.status != JobStatus::Failed {
            return Err(not_restartable(target.status));
        }
        if !self.registry.reset_failed(&target.id, now)? {
            let current = self
                .registry
                .find_by_id(&target.id)?
                .map(|r| r.status)
                .unwrap_or(target.status);
            return Err(not_restartable(current));
        }

        log::info!(
            "Restarted stage {} ({}) of chain {}",
            target.id,
            target.stage_name,
            chain_id
        );
        if let Some(events) = &self.events {
            events.send(
                ChainEvent::new(
                    ChainEventKind::StageRestarted,
                    Some(chain_id),
                    &target.id,
                    &target.stage_name,
                    JobStatus::Pending,
                )
                .with_attempt(target.attempt + 1),
            );
        }

        self.recomputer.recompute(chain_id, now)?;
        self.get_chain(chain_id)
    }
}

fn normalize_date(value: Option<&str>) -> Result<Option<String>, ChainError> {
    value
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|dt| format_timestamp(dt.with_timezone(&Utc)))
                .map_err(|e| ChainError::InvalidQuery(format!("invalid date '{}': {}", raw, e)))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::identity::{StageContext, StagePayload};
    use crate::chain::order::ChainOrderResolver;
    use crate::chain::pending::MemoryQueue;
    use crate::chain::registry::{NewRoot, StageOutcome, StageRef};
    use crate::db::Database;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    struct Fixture {
        registry: ChainRegistry,
        recomputer: RootRecomputer,
        queue: Arc<MemoryQueue>,
        model: ChainReadModel,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 4, 16, 0, 0).unwrap()
    }

    fn fixture() -> Fixture {
        let registry = ChainRegistry::new(
            Database::open_in_memory().unwrap(),
            Arc::new(ChainOrderResolver::default()),
        );
        let recomputer = RootRecomputer::new(registry.clone());
        let queue = Arc::new(MemoryQueue::new());
        let pending = PendingStageInspector::new(registry.clone(), queue.clone());
        let model = ChainReadModel::new(registry.clone(), recomputer.clone(), pending);
        Fixture {
            registry,
            recomputer,
            queue,
            model,
        }
    }

    impl Fixture {
        fn root(&self, id: &str, at: DateTime<Utc>) {
            self.registry
                .ensure_root(
                    &NewRoot {
                        id: id.to_string(),
                        ..Default::default()
                    },
                    at,
                )
                .unwrap();
        }

        fn run(&self, id: &str, root: &str, name: &str, outcome: Option<StageOutcome>) {
            let stage = StageRef {
                id: id.to_string(),
                parent_id: Some(root.to_string()),
                stage_name: name.to_string(),
                queue: "documents".to_string(),
                linkage_unresolved: false,
            };
            let record = self.registry.start_stage(&stage, t0()).unwrap();
            if let Some(outcome) = outcome {
                self.registry
                    .finish_stage(&stage, record.attempt, &outcome, t0() + Duration::seconds(2))
                    .unwrap();
            }
            self.recomputer.recompute(root, t0() + Duration::seconds(2)).unwrap();
        }
    }

    fn failed(message: &str) -> Option<StageOutcome> {
        Some(StageOutcome::Failed {
            message: message.to_string(),
        })
    }

    #[test]
    fn test_get_chain_orders_steps() {
        let f = fixture();
        f.root("r1", t0());
        f.run("s3", "r1", "Extract Text", None);
        f.run("s1", "r1", "Process File", Some(StageOutcome::Completed));
        f.run("s2", "r1", "Convert Document", Some(StageOutcome::Completed));

        let view = f.model.get_chain("r1").unwrap();
        let names: Vec<&str> = view.steps.iter().map(|s| s.stage_name.as_str()).collect();
        assert_eq!(names, vec!["Process File", "Convert Document", "Extract Text"]);
        assert_eq!(view.status, JobStatus::Processing);
        assert_eq!(view.progress, 67);
        assert_eq!(view.steps[0].duration_ms, Some(2000));
        assert_eq!(view.steps[2].duration_ms, None);
        assert_eq!(view.completed_stages, 2);
    }

    #[test]
    fn test_get_chain_unknown() {
        let f = fixture();
        assert!(matches!(
            f.model.get_chain("nope"),
            Err(ChainError::RootNotFound(_))
        ));
    }

    #[test]
    fn test_statistics_fold_unclaimed_units_into_pending() {
        let f = fixture();
        f.root("r1", t0());
        f.root("r2", t0());
        f.run("s1", "r2", "Process File", Some(StageOutcome::Completed));
        f.queue.push(StagePayload::new(
            "u9",
            StageContext {
                chain_id: "r3".to_string(),
                stage_name: "Process File".to_string(),
            },
        ));

        let stats = f.model.get_statistics().unwrap();
        assert_eq!(
            stats,
            ChainStatistics {
                pending: 2,
                processing: 0,
                completed: 1,
                failed: 0,
                queued: 1,
            }
        );
    }

    #[test]
    fn test_restart_failed_stage() {
        let f = fixture();
        f.root("r1", t0());
        f.run("s1", "r1", "Process File", Some(StageOutcome::Completed));
        f.run("s2", "r1", "Convert Document", failed("corrupt pdf"));
        assert_eq!(f.model.get_chain("r1").unwrap().status, JobStatus::Failed);

        let view = f
            .model
            .restart_stage("r1", "convert document", t0() + Duration::minutes(1))
            .unwrap();
        assert_eq!(view.status, JobStatus::Pending);
        assert!(view.exception.is_none());
        assert!(view.finished_at.is_none());
        let step = &view.steps[1];
        assert_eq!(step.status, JobStatus::Pending);
        assert!(step.exception.is_none());
        assert_eq!(step.attempt, 2);
        assert_eq!(step.started_at, None);
    }

    #[test]
    fn test_restart_rejects_non_failed_stage() {
        let f = fixture();
        f.root("r1", t0());
        f.run("s1", "r1", "Process File", Some(StageOutcome::Completed));

        let err = f
            .model
            .restart_stage("r1", "Process File", t0())
            .unwrap_err();
        assert!(matches!(err, ChainError::NotRestartable { ref status, .. } if status == "completed"));

        let err = f.model.restart_stage("r1", "Analyze Document", t0()).unwrap_err();
        assert!(matches!(err, ChainError::StageNotFound { .. }));
    }

    #[test]
    fn test_list_chains_filters_and_paginates() {
        let f = fixture();
        for i in 0..4 {
            f.root(&format!("r{}", i), t0() + Duration::hours(i));
        }
        f.run("s1", "r0", "Process File", failed("boom"));

        let all = f.model.list_chains(&ChainQueryParams::default()).unwrap();
        assert_eq!(all.total, 4);
        assert_eq!(all.chains[0].id, "r3");

        let failed_only = f
            .model
            .list_chains(&ChainQueryParams {
                status: Some("failed".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(failed_only.total, 1);
        assert_eq!(failed_only.chains[0].id, "r0");

        let window = f
            .model
            .list_chains(&ChainQueryParams {
                from_date: Some("2026-07-04T17:00:00+00:00".to_string()),
                limit: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(window.total, 3);
        assert_eq!(window.chains.len(), 2);
    }

    #[test]
    fn test_list_chains_rejects_bad_input() {
        let f = fixture();
        let bad_status = f.model.list_chains(&ChainQueryParams {
            status: Some("exploded".to_string()),
            ..Default::default()
        });
        assert!(matches!(bad_status, Err(ChainError::InvalidQuery(_))));

        let bad_date = f.model.list_chains(&ChainQueryParams {
            to_date: Some("last tuesday".to_string()),
            ..Default::default()
        });
        assert!(matches!(bad_date, Err(ChainError::InvalidQuery(_))));
    }

    #[test]
    fn test_queued_units_appear_on_their_chain() {
        let f = fixture();
        f.root("r1", t0());
        f.run("s1", "r1", "Process File", Some(StageOutcome::Completed));
        f.queue.push(StagePayload::new(
            "s2",
            StageContext {
                chain_id: "r1".to_string(),
                stage_name: "Convert Document".to_string(),
            },
        ));

        let view = f.model.get_chain("r1").unwrap();
        assert_eq!(view.queued.len(), 1);
        assert_eq!(view.queued[0].stage_name, "Convert Document");
        assert_eq!(f.model.pending_grouped().unwrap()["r1"].len(), 1);
    }
}
