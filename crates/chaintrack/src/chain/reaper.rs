//! Stuck stage detection.
//!
//! A stage that has been `processing` for longer than its timeout is failed
//! with [`TIMEOUT_EXCEPTION`]. This is an observation only: the worker may
//! still be running and may report later, in which case its report is
//! rejected as conflicting.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info_span;

use crate::broadcast::{ChainEvent, ChainEventBroadcaster, ChainEventKind};
use crate::chain::record::JobStatus;
use crate::chain::recompute::RootRecomputer;
use crate::chain::registry::ChainRegistry;
use crate::error::ChainError;

/// Exception recorded on stages failed by the reaper.
pub const TIMEOUT_EXCEPTION: &str = "Stage timed out: no completion reported within the allowed time";

/// Default stuck threshold: one hour.
pub const DEFAULT_STUCK_THRESHOLD_SECS: u64 = 60 * 60;

/// How long each stage may stay in `processing`.
#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    default: Duration,
    overrides: HashMap<String, Duration>,
}

impl TimeoutPolicy {
    pub fn new(default: Duration) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn from_secs(default_secs: u64) -> Self {
        Self::new(secs(default_secs))
    }

    pub fn with_override(mut self, stage_name: &str, timeout: Duration) -> Self {
        self.overrides.insert(normalize(stage_name), timeout);
        self
    }

    pub fn threshold_for(&self, stage_name: &str) -> Duration {
        self.overrides
            .get(&normalize(stage_name))
            .copied()
            .unwrap_or(self.default)
    }

    /// Shortest configured timeout; bounds the candidate query.
    pub fn min_threshold(&self) -> Duration {
        self.overrides
            .values()
            .copied()
            .fold(self.default, |a, b| a.min(b))
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::from_secs(DEFAULT_STUCK_THRESHOLD_SECS)
    }
}

pub(crate) fn secs(value: u64) -> Duration {
    i64::try_from(value)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

fn cutoff(now: DateTime<Utc>, threshold: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(threshold)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn normalize(stage_name: &str) -> String {
    stage_name.trim().to_lowercase()
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Rows old enough to be checked against their stage's timeout.
    pub examined: usize,
    /// Stage ids this sweep moved to `failed`.
    pub timed_out: Vec<String>,
    pub roots_recomputed: Vec<String>,
    /// Roots whose recomputation failed, with the error message.
    pub recompute_failures: Vec<(String, String)>,
}

#[derive(Clone)]
pub struct StuckStageReaper {
    registry: ChainRegistry,
    recomputer: RootRecomputer,
    policy: TimeoutPolicy,
    events: Option<ChainEventBroadcaster>,
}

impl StuckStageReaper {
    pub fn new(registry: ChainRegistry, recomputer: RootRecomputer, policy: TimeoutPolicy) -> Self {
        Self {
            registry,
            recomputer,
            policy,
            events: None,
        }
    }

    pub fn with_events(mut self, events: ChainEventBroadcaster) -> Self {
        self.events = Some(events);
        self
    }

    pub fn policy(&self) -> &TimeoutPolicy {
        &self.policy
    }

    /// Fails every stage stuck in `processing` past its timeout and
    /// recomputes the affected roots. Safe to run concurrently.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, ChainError> {
        let _span = info_span!("reaper_sweep", now = %now).entered();

        let candidates = self
            .registry
            .processing_started_before(cutoff(now, self.policy.min_threshold()))?;
        let mut report = SweepReport {
            examined: candidates.len(),
            ..Default::default()
        };
        let mut roots = BTreeSet::new();

        for stage in candidates {
            let Some(started_at) = stage.started_at else {
                continue;
            };
            if started_at >= cutoff(now, self.policy.threshold_for(&stage.stage_name)) {
                continue;
            }
            if !self
                .registry
                .fail_if_processing(&stage, TIMEOUT_EXCEPTION, now)?
            {
                // Finished or failed by someone else in the meantime.
                continue;
            }

            log::warn!(
                "Stage {} ({}) stuck in processing since {}, marked failed",
                stage.id,
                stage.stage_name,
                started_at
            );
            if let Some(events) = &self.events {
                events.send(
                    ChainEvent::new(
                        ChainEventKind::StageTimedOut,
                        stage.parent_id.as_deref(),
                        &stage.id,
                        &stage.stage_name,
                        JobStatus::Failed,
                    )
                    .with_attempt(stage.attempt)
                    .with_error(Some(TIMEOUT_EXCEPTION)),
                );
            }
            if let Some(root_id) = stage.parent_id.clone() {
                roots.insert(root_id);
            }
            report.timed_out.push(stage.id);
        }

        for root_id in roots {
            match self.recomputer.recompute(&root_id, now) {
                Ok(_) => report.roots_recomputed.push(root_id),
                Err(e) => {
                    log::error!("Failed to recompute chain {} after sweep: {}", root_id, e);
                    report.recompute_failures.push((root_id, e.to_string()));
                }
            }
        }

        if !report.timed_out.is_empty() {
            log::info!("Reaper failed {} stuck stage(s)", report.timed_out.len());
        }
        Ok(report)
    }
}

/// Runs the reaper periodically in a background thread.
pub struct ReaperScheduler {
    reaper: Arc<StuckStageReaper>,
    interval: StdDuration,
    shutdown: Arc<AtomicBool>,
}

impl ReaperScheduler {
    pub fn new(reaper: Arc<StuckStageReaper>, interval: StdDuration) -> Self {
        Self {
            reaper,
            // tokio intervals panic on zero
            interval: interval.max(StdDuration::from_millis(1)),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Starts the sweep loop. Every message on `trigger_rx` runs an extra sweep.
    pub fn start(&self, mut trigger_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let reaper = Arc::clone(&self.reaper);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.interval;

        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    log::error!("Failed to start reaper runtime: {}", e);
                    return;
                }
            };

            rt.block_on(async {
                let mut interval_timer = tokio::time::interval(interval);
                interval_timer.tick().await; // skip immediate first tick

                loop {
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    tokio::select! {
                        _ = interval_timer.tick() => {},
                        Ok(()) = trigger_rx.recv() => {
                            log::info!("Manual reaper sweep triggered");
                        },
                    }

                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    if let Err(e) = reaper.sweep(Utc::now()) {
                        log::error!("Reaper sweep failed: {}", e);
                    }
                }
            });
        })
    }

    /// Signals the scheduler to stop.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::order::ChainOrderResolver;
    use crate::chain::registry::{NewRoot, StageOutcome, StageRef};
    use crate::db::Database;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap()
    }

    fn setup(policy: TimeoutPolicy) -> (ChainRegistry, StuckStageReaper) {
        let registry = ChainRegistry::new(
            Database::open_in_memory().unwrap(),
            Arc::new(ChainOrderResolver::default()),
        );
        registry
            .ensure_root(
                &NewRoot {
                    id: "r1".to_string(),
                    ..Default::default()
                },
                t0(),
            )
            .unwrap();
        let recomputer = RootRecomputer::new(registry.clone());
        let reaper = StuckStageReaper::new(registry.clone(), recomputer, policy);
        (registry, reaper)
    }

    fn start(registry: &ChainRegistry, id: &str, name: &str, at: DateTime<Utc>) {
        registry
            .start_stage(
                &StageRef {
                    id: id.to_string(),
                    parent_id: Some("r1".to_string()),
                    stage_name: name.to_string(),
                    queue: "default".to_string(),
                    linkage_unresolved: false,
                },
                at,
            )
            .unwrap();
    }

    #[test]
    fn test_stage_past_threshold_is_failed() {
        let (registry, reaper) = setup(TimeoutPolicy::from_secs(60 * 60));
        start(&registry, "s1", "Extract Text", t0());

        let now = t0() + Duration::minutes(61);
        let report = reaper.sweep(now).unwrap();
        assert_eq!(report.timed_out, vec!["s1".to_string()]);
        assert_eq!(report.roots_recomputed, vec!["r1".to_string()]);

        let stage = registry.find_by_id("s1").unwrap().unwrap();
        assert_eq!(stage.status, JobStatus::Failed);
        assert_eq!(stage.exception.as_deref(), Some(TIMEOUT_EXCEPTION));
        assert_eq!(stage.finished_at, Some(now));

        let root = registry.find_by_id("r1").unwrap().unwrap();
        assert_eq!(root.status, JobStatus::Failed);
    }

    #[test]
    fn test_recent_stage_is_left_alone() {
        let (registry, reaper) = setup(TimeoutPolicy::default());
        start(&registry, "s1", "Extract Text", t0());

        let report = reaper.sweep(t0() + Duration::minutes(59)).unwrap();
        assert!(report.timed_out.is_empty());
        let stage = registry.find_by_id("s1").unwrap().unwrap();
        assert_eq!(stage.status, JobStatus::Processing);
    }

    #[test]
    fn test_second_sweep_is_a_no_op() {
        let (registry, reaper) = setup(TimeoutPolicy::default());
        start(&registry, "s1", "Extract Text", t0());

        let first = reaper.sweep(t0() + Duration::minutes(61)).unwrap();
        let second = reaper.sweep(t0() + Duration::minutes(62)).unwrap();
        assert_eq!(first.timed_out.len(), 1);
        assert!(second.timed_out.is_empty());

        let stage = registry.find_by_id("s1").unwrap().unwrap();
        assert_eq!(stage.finished_at, Some(t0() + Duration::minutes(61)));
    }

    #[test]
    fn test_per_stage_override() {
        let policy = TimeoutPolicy::default().with_override("analyze document", Duration::hours(4));
        let (registry, reaper) = setup(policy);
        start(&registry, "s1", "Analyze Document", t0());
        start(&registry, "s2", "Extract Text", t0());

        let report = reaper.sweep(t0() + Duration::hours(2)).unwrap();
        assert_eq!(report.timed_out, vec!["s2".to_string()]);
        assert_eq!(report.examined, 2);
    }

    #[test]
    fn test_shorter_override_widens_candidate_window() {
        let policy = TimeoutPolicy::default().with_override("Process File", Duration::minutes(5));
        assert_eq!(policy.min_threshold(), Duration::minutes(5));
        let (registry, reaper) = setup(policy);
        start(&registry, "s1", "Process File", t0());

        let report = reaper.sweep(t0() + Duration::minutes(6)).unwrap();
        assert_eq!(report.timed_out, vec!["s1".to_string()]);
    }

    #[test]
    fn test_late_worker_report_is_rejected() {
        let (registry, reaper) = setup(TimeoutPolicy::default());
        let stage = StageRef {
            id: "s1".to_string(),
            parent_id: Some("r1".to_string()),
            stage_name: "Extract Text".to_string(),
            queue: "default".to_string(),
            linkage_unresolved: false,
        };
        registry.start_stage(&stage, t0()).unwrap();
        reaper.sweep(t0() + Duration::hours(2)).unwrap();

        let late = registry
            .finish_stage(&stage, 1, &StageOutcome::Completed, t0() + Duration::hours(3))
            .unwrap();
        assert_eq!(
            late.outcome,
            crate::chain::registry::TransitionOutcome::Conflicting
        );
    }

    #[test]
    fn test_scheduler_shutdown() {
        let (_registry, reaper) = setup(TimeoutPolicy::default());
        let scheduler = ReaperScheduler::new(Arc::new(reaper), StdDuration::from_millis(50));

        let (trigger_tx, trigger_rx) = broadcast::channel(16);
        let handle = scheduler.start(trigger_rx);

        std::thread::sleep(StdDuration::from_millis(100));
        scheduler.stop();
        // Wake the select loop so it sees the shutdown
        let _ = trigger_tx.send(());

        handle.join().expect("reaper thread panicked");
    }
}
