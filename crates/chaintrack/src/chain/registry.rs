//! Chain registry: durable storage of root and stage rows.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::chain::order::ChainOrderResolver;
use crate::chain::record::{format_timestamp, JobRecord, JobStatus};
use crate::db::job_repo::{self, JobRow, RootFilter};
use crate::db::{Database, DatabaseError};

/// Stage name given to root rows that were created implicitly by their first stage.
pub const ROOT_STAGE_NAME: &str = "Chain";

/// Queue name used when a payload does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Identity of one stage unit as known to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRef {
    pub id: String,
    pub parent_id: Option<String>,
    pub stage_name: String,
    pub queue: String,
    pub linkage_unresolved: bool,
}

/// A chain root to create at submission time or on its first stage start.
#[derive(Debug, Clone, Default)]
pub struct NewRoot {
    pub id: String,
    pub stage_name: Option<String>,
    pub queue: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub expected_stages: Vec<String>,
}

/// Fields written by the generic [`ChainRegistry::upsert`].
#[derive(Debug, Clone)]
pub struct JobUpsert {
    pub stage: StageRef,
    pub status: JobStatus,
    pub progress: u8,
    pub exception: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

/// How a stage finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Completed,
    Failed { message: String },
}

impl StageOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            StageOutcome::Completed => JobStatus::Completed,
            StageOutcome::Failed { .. } => JobStatus::Failed,
        }
    }
}

/// Result of a terminal write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionOutcome {
    /// The row moved to the reported terminal status.
    Applied,
    /// The row already had the reported terminal status.
    Duplicate,
    /// The row was already in the opposite terminal status; the report was rejected.
    Conflicting,
    /// The report belongs to an attempt other than the row's current one, or
    /// the row is not running.
    Stale,
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub outcome: TransitionOutcome,
    pub record: JobRecord,
}

/// Typed access to the `jobs` table.
///
/// Cloning is cheap; every clone shares the same database handle.
#[derive(Clone)]
pub struct ChainRegistry {
    db: Database,
    order: Arc<ChainOrderResolver>,
}

impl ChainRegistry {
    pub fn new(db: Database, order: Arc<ChainOrderResolver>) -> Self {
        Self { db, order }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn order(&self) -> &ChainOrderResolver {
        &self.order
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<JobRecord>, DatabaseError> {
        job_repo::find_by_id(&self.db, id)?
            .map(JobRecord::from_row)
            .transpose()
    }

    /// All rows owned by `parent_id`, every attempt, oldest first.
    pub fn children_of(&self, parent_id: &str) -> Result<Vec<JobRecord>, DatabaseError> {
        job_repo::children_of(&self.db, parent_id)?
            .into_iter()
            .map(JobRecord::from_row)
            .collect()
    }

    /// Root rows matching `filter`, newest first, with the total match count.
    pub fn roots_where(&self, filter: &RootFilter) -> Result<(Vec<JobRecord>, u64), DatabaseError> {
        let (rows, total) = job_repo::query_roots(&self.db, filter)?;
        let records = rows
            .into_iter()
            .map(JobRecord::from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((records, total))
    }

    pub fn count_roots_by_status(&self, status: JobStatus) -> Result<u64, DatabaseError> {
        job_repo::count_roots_by_status(&self.db, status.as_str())
    }

    /// Creates the root row unless it already exists. Returns `true` if this
    /// call created it.
    pub fn ensure_root(&self, root: &NewRoot, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let now = format_timestamp(now);
        let row = JobRow {
            id: root.id.clone(),
            parent_id: None,
            stage_name: root
                .stage_name
                .clone()
                .unwrap_or_else(|| ROOT_STAGE_NAME.to_string()),
            queue: root
                .queue
                .clone()
                .unwrap_or_else(|| DEFAULT_QUEUE.to_string()),
            status: JobStatus::Pending.as_str().to_string(),
            progress: 0,
            attempt: 1,
            metadata: root.metadata.as_ref().map(|m| m.to_string()),
            expected_stages: if root.expected_stages.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&root.expected_stages).unwrap_or_default())
            },
            created_at: now.clone(),
            updated_at: now,
            ..Default::default()
        };

        let created = job_repo::insert_if_absent(&self.db, &row)?;
        if created {
            log::info!("Registered chain root {}", root.id);
        }
        Ok(created)
    }

    /// Atomic find-or-create-or-update of a row's mutable fields.
    pub fn upsert(&self, fields: &JobUpsert, now: DateTime<Utc>) -> Result<JobRecord, DatabaseError> {
        let now = format_timestamp(now);
        let row = JobRow {
            id: fields.stage.id.clone(),
            parent_id: fields.stage.parent_id.clone(),
            stage_name: fields.stage.stage_name.clone(),
            queue: fields.stage.queue.clone(),
            status: fields.status.as_str().to_string(),
            progress: i64::from(fields.progress.min(100)),
            attempt: 1,
            started_at: fields.started_at.map(format_timestamp),
            finished_at: fields.finished_at.map(format_timestamp),
            exception: fields.exception.clone(),
            order_in_chain: self.order.order_of(&fields.stage.stage_name),
            metadata: fields.metadata.as_ref().map(|m| m.to_string()),
            linkage_unresolved: fields.stage.linkage_unresolved,
            created_at: now.clone(),
            updated_at: now,
            ..Default::default()
        };
        JobRecord::from_row(job_repo::upsert(&self.db, &row)?)
    }

    /// Moves the stage row to `processing` for a new attempt, creating it if needed.
    pub fn start_stage(&self, stage: &StageRef, now: DateTime<Utc>) -> Result<JobRecord, DatabaseError> {
        let row = JobRow {
            id: stage.id.clone(),
            parent_id: stage.parent_id.clone(),
            stage_name: stage.stage_name.clone(),
            queue: stage.queue.clone(),
            started_at: Some(format_timestamp(now)),
            order_in_chain: self.order.order_of(&stage.stage_name),
            linkage_unresolved: stage.linkage_unresolved,
            ..Default::default()
        };
        JobRecord::from_row(job_repo::upsert_started(&self.db, &row)?)
    }

    /// Records the end of `attempt` of a stage.
    ///
    /// The first terminal write for an id and attempt wins; later reports are
    /// classified and logged but never overwrite it.
    pub fn finish_stage(
        &self,
        stage: &StageRef,
        attempt: u32,
        outcome: &StageOutcome,
        now: DateTime<Utc>,
    ) -> Result<Transition, DatabaseError> {
        let status = outcome.status();
        let (progress, exception) = match outcome {
            StageOutcome::Completed => (Some(100), None),
            StageOutcome::Failed { message } => (None, Some(message.as_str())),
        };

        let changed = job_repo::mark_terminal(
            &self.db,
            &stage.id,
            i64::from(attempt),
            status.as_str(),
            progress,
            exception,
            &format_timestamp(now),
        )?;

        if changed == 1 {
            let record = self
                .find_by_id(&stage.id)?
                .ok_or_else(|| missing_after_write(&stage.id))?;
            return Ok(Transition {
                outcome: TransitionOutcome::Applied,
                record,
            });
        }

        let Some(existing) = self.find_by_id(&stage.id)? else {
            log::warn!(
                "Stage {} reported {} without a recorded start, creating it",
                stage.id,
                status
            );
            let record = self.upsert(
                &JobUpsert {
                    stage: stage.clone(),
                    status,
                    progress: progress.map(|p| p as u8).unwrap_or(0),
                    exception: exception.map(str::to_string),
                    started_at: None,
                    finished_at: Some(now),
                    metadata: None,
                },
                now,
            )?;
            return Ok(Transition {
                outcome: TransitionOutcome::Applied,
                record,
            });
        };

        let outcome = if existing.attempt != attempt {
            log::warn!(
                "Ignoring {} report for stage {} attempt {}: row is at attempt {}",
                status,
                stage.id,
                attempt,
                existing.attempt
            );
            TransitionOutcome::Stale
        } else if !existing.status.is_terminal() {
            log::warn!(
                "Ignoring {} report for stage {} attempt {}: row is {}, not running",
                status,
                stage.id,
                attempt,
                existing.status
            );
            TransitionOutcome::Stale
        } else if existing.status == status {
            log::debug!(
                "Duplicate {} report for stage {} attempt {}",
                status,
                stage.id,
                attempt
            );
            TransitionOutcome::Duplicate
        } else {
            log::warn!(
                "Conflicting report for stage {} attempt {}: already {}, rejected {}",
                stage.id,
                attempt,
                existing.status,
                status
            );
            TransitionOutcome::Conflicting
        };

        Ok(Transition {
            outcome,
            record: existing,
        })
    }

    /// Stage rows in `processing` whose start is older than `cutoff`.
    pub fn processing_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, DatabaseError> {
        job_repo::find_processing_started_before(&self.db, &format_timestamp(cutoff))?
            .into_iter()
            .map(JobRecord::from_row)
            .collect()
    }

    /// Fails the row if, and only if, it is still processing the same attempt.
    pub fn fail_if_processing(
        &self,
        record: &JobRecord,
        exception: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = job_repo::fail_if_processing(
            &self.db,
            &record.id,
            i64::from(record.attempt),
            exception,
            &format_timestamp(now),
        )?;
        Ok(changed == 1)
    }

    /// Resets a failed row to pending. Returns `false` if it was not failed.
    pub fn reset_failed(&self, id: &str, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        Ok(job_repo::reset_failed(&self.db, id, &format_timestamp(now))? == 1)
    }

    /// Writes the derived root fields guarded by the root's version.
    /// Returns `false` if another writer got there first.
    pub fn write_root_aggregate(
        &self,
        root: &JobRecord,
        expected_version: i64,
    ) -> Result<bool, DatabaseError> {
        Ok(job_repo::update_root_aggregate(&self.db, &root.to_row(), expected_version)? == 1)
    }
}

fn missing_after_write(id: &str) -> DatabaseError {
    DatabaseError::InvalidValue {
        row_id: id.to_string(),
        column: "id",
        value: "row vanished after update".to_string(),
    }
}
