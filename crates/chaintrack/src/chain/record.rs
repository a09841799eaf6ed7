//! Typed job records and their mapping to raw database rows.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::db::job_repo::JobRow;
use crate::db::DatabaseError;

/// Lifecycle status of a root or stage row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(other.to_string()),
        }
    }
}

/// Formats a timestamp with fixed millisecond precision and a `Z` suffix,
/// so stored values sort lexicographically in time order.
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(
    value: &str,
    row_id: &str,
    column: &'static str,
) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| DatabaseError::InvalidValue {
            row_id: row_id.to_string(),
            column,
            value: value.to_string(),
        })
}

fn parse_optional_timestamp(
    value: Option<&str>,
    row_id: &str,
    column: &'static str,
) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    value
        .map(|v| parse_timestamp(v, row_id, column))
        .transpose()
}

/// One row of the chain registry: a root (chain aggregate) or a stage attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    /// `None` marks a root unless `linkage_unresolved` is set.
    pub parent_id: Option<String>,
    pub stage_name: String,
    pub queue: String,
    pub status: JobStatus,
    pub progress: u8,
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exception: Option<String>,
    pub order_in_chain: i64,
    /// Opaque metadata snapshot (roots carry the chain's initial metadata).
    pub metadata: Option<serde_json::Value>,
    /// The stage could not report which chain it belongs to.
    pub linkage_unresolved: bool,
    /// Stage names declared for the chain at submission time (roots only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expected_stages: Vec<String>,
    #[serde(skip)]
    pub version: i64,
    #[serde(skip)]
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none() && !self.linkage_unresolved
    }

    /// Converts a raw database row, rejecting values the registry never writes.
    pub fn from_row(row: JobRow) -> Result<Self, DatabaseError> {
        let invalid = |column: &'static str, value: String| DatabaseError::InvalidValue {
            row_id: row.id.clone(),
            column,
            value,
        };

        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|v| invalid("status", v))?;
        let progress =
            u8::try_from(row.progress).map_err(|_| invalid("progress", row.progress.to_string()))?;
        let attempt =
            u32::try_from(row.attempt).map_err(|_| invalid("attempt", row.attempt.to_string()))?;
        let metadata = match row.metadata.as_deref() {
            Some(raw) => Some(
                serde_json::from_str(raw).map_err(|_| invalid("metadata", raw.to_string()))?,
            ),
            None => None,
        };
        let expected_stages = match row.expected_stages.as_deref() {
            Some(raw) => serde_json::from_str::<Vec<String>>(raw)
                .map_err(|_| invalid("expected_stages", raw.to_string()))?,
            None => Vec::new(),
        };

        Ok(Self {
            started_at: parse_optional_timestamp(row.started_at.as_deref(), &row.id, "started_at")?,
            finished_at: parse_optional_timestamp(
                row.finished_at.as_deref(),
                &row.id,
                "finished_at",
            )?,
            created_at: parse_timestamp(&row.created_at, &row.id, "created_at")?,
            updated_at: parse_timestamp(&row.updated_at, &row.id, "updated_at")?,
            id: row.id,
            parent_id: row.parent_id,
            stage_name: row.stage_name,
            queue: row.queue,
            status,
            progress,
            attempt,
            exception: row.exception,
            order_in_chain: row.order_in_chain,
            metadata,
            linkage_unresolved: row.linkage_unresolved,
            expected_stages,
            version: row.version,
            sequence: row.seq,
        })
    }

    /// Converts back into a raw row for writing.
    pub fn to_row(&self) -> JobRow {
        JobRow {
            seq: self.sequence,
            id: self.id.clone(),
            parent_id: self.parent_id.clone(),
            stage_name: self.stage_name.clone(),
            queue: self.queue.clone(),
            status: self.status.as_str().to_string(),
            progress: i64::from(self.progress),
            attempt: i64::from(self.attempt),
            started_at: self.started_at.map(format_timestamp),
            finished_at: self.finished_at.map(format_timestamp),
            exception: self.exception.clone(),
            order_in_chain: self.order_in_chain,
            metadata: self.metadata.as_ref().map(|m| m.to_string()),
            linkage_unresolved: self.linkage_unresolved,
            version: self.version,
            expected_stages: if self.expected_stages.is_empty() {
                None
            } else {
                serde_json::to_string(&self.expected_stages).ok()
            },
            created_at: format_timestamp(self.created_at),
            updated_at: format_timestamp(self.updated_at),
        }
    }
}
