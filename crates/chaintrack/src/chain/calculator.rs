//! Root aggregation: derives a chain's status and progress from its stages.
//!
//! Everything in here is pure. The caller loads the root and its children,
//! calls [`calculate`], and persists the result.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::chain::record::{JobRecord, JobStatus};

/// Derived fields of a root row.
#[derive(Debug, Clone, PartialEq)]
pub struct RootAggregate {
    pub status: JobStatus,
    pub progress: u8,
    pub completed_stages: usize,
    pub total_stages: usize,
    /// Effective failed stages in chain order.
    pub failed_stages: Vec<FailedStage>,
    pub exception: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedStage {
    pub stage_name: String,
    pub exception: Option<String>,
}

impl RootAggregate {
    /// `true` if writing this aggregate would not change the stored root.
    pub fn matches(&self, root: &JobRecord) -> bool {
        root.status == self.status
            && root.progress == self.progress
            && root.exception == self.exception
            && root.started_at == self.started_at
            && root.finished_at == self.finished_at
    }

    /// Copies the derived fields onto `root`.
    pub fn apply_to(&self, root: &mut JobRecord) {
        root.status = self.status;
        root.progress = self.progress;
        root.exception = self.exception.clone();
        root.started_at = self.started_at;
        root.finished_at = self.finished_at;
    }
}

/// One row per stage name: the latest-created row, ties broken by insertion
/// sequence. Sorted by chain order, then creation.
pub fn effective_children(children: &[JobRecord]) -> Vec<&JobRecord> {
    let mut latest: HashMap<&str, &JobRecord> = HashMap::new();
    for child in children.iter().filter(|c| !c.linkage_unresolved) {
        latest
            .entry(child.stage_name.as_str())
            .and_modify(|current| {
                if (child.created_at, child.sequence) > (current.created_at, current.sequence) {
                    *current = child;
                }
            })
            .or_insert(child);
    }

    let mut effective: Vec<&JobRecord> = latest.into_values().collect();
    effective.sort_by_key(|r| (r.order_in_chain, r.created_at, r.sequence));
    effective
}

/// Derives the root's status, progress and failure summary.
///
/// Precedence: processing, then pending, then failed, then declared but unseen
/// stages (pending), then completed. A failure surfaces on the root only once
/// no sibling is still running or waiting.
///
/// Stage names declared on the root but not yet observed count as pending
/// stages. They never outrank a recorded failure, since a failed chain does
/// not dispatch its later stages.
pub fn calculate(root: &JobRecord, children: &[JobRecord], now: DateTime<Utc>) -> RootAggregate {
    let effective = effective_children(children);

    let unseen = root
        .expected_stages
        .iter()
        .filter(|declared| {
            let declared = declared.trim();
            !effective
                .iter()
                .any(|r| r.stage_name.trim().eq_ignore_ascii_case(declared))
        })
        .count();

    let total_stages = effective.len() + unseen;
    let completed_stages = effective
        .iter()
        .filter(|r| r.status == JobStatus::Completed)
        .count();
    let has = |status: JobStatus| effective.iter().any(|r| r.status == status);

    let status = if has(JobStatus::Processing) {
        JobStatus::Processing
    } else if has(JobStatus::Pending) {
        JobStatus::Pending
    } else if has(JobStatus::Failed) {
        JobStatus::Failed
    } else if unseen > 0 {
        JobStatus::Pending
    } else if total_stages > 0 {
        JobStatus::Completed
    } else {
        root.status
    };

    let progress = if total_stages == 0 {
        root.progress
    } else {
        rounded_percent(completed_stages, total_stages)
    };

    let failed_stages: Vec<FailedStage> = effective
        .iter()
        .filter(|r| r.status == JobStatus::Failed)
        .map(|r| FailedStage {
            stage_name: r.stage_name.clone(),
            exception: r.exception.clone(),
        })
        .collect();

    let exception = match status {
        JobStatus::Failed => Some(failure_summary(&failed_stages)),
        _ if total_stages == 0 => root.exception.clone(),
        _ => None,
    };

    let started_at = effective
        .iter()
        .filter_map(|r| r.started_at)
        .min()
        .or(root.started_at);

    let finished_at = if !status.is_terminal() {
        None
    } else if root.status == status && root.finished_at.is_some() {
        root.finished_at
    } else {
        Some(now)
    };

    RootAggregate {
        status,
        progress,
        completed_stages,
        total_stages,
        failed_stages,
        exception,
        started_at,
        finished_at,
    }
}

/// `round(100 * part / whole)` with halves rounded up, clamped to 100.
fn rounded_percent(part: usize, whole: usize) -> u8 {
    let part = part.min(whole) as u64;
    let whole = whole as u64;
    ((200 * part + whole) / (2 * whole)) as u8
}

fn failure_summary(failed: &[FailedStage]) -> String {
    let stages: Vec<String> = failed
        .iter()
        .map(|f| match f.exception.as_deref() {
            Some(message) if !message.is_empty() => format!("{} ({})", f.stage_name, message),
            _ => f.stage_name.clone(),
        })
        .collect();
    format!("Failed stages: {}", stages.join("; "))
}
