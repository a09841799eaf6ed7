//! Stuck stage detection.

mod common;

use std::time::{Duration as StdDuration, Instant};

use chrono::{Duration, Utc};

use chaintrack::chain::{TransitionOutcome, TIMEOUT_EXCEPTION};
use chaintrack::JobStatus;
use common::{stage_payload, ConfigBuilder, TestHarness};

#[test]
fn test_stage_past_threshold_is_failed() {
    let harness = TestHarness::with_config(ConfigBuilder::new().stuck_threshold_secs(3600).build());
    let tracker = harness.tracker();
    let now = Utc::now();

    tracker
        .run_stage(&stage_payload("u1", "r1", "Process File"), |_| Ok(()))
        .unwrap();
    let handle = tracker
        .interceptor()
        .before(
            &stage_payload("u2", "r1", "Extract Text"),
            now - Duration::minutes(61),
        )
        .unwrap();

    let report = tracker.reaper().sweep(now).unwrap();
    assert_eq!(report.timed_out, vec!["u2".to_string()]);

    let row = tracker.registry().find_by_id("u2").unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Failed);
    assert_eq!(row.exception.as_deref(), Some(TIMEOUT_EXCEPTION));
    let root = tracker.registry().find_by_id("r1").unwrap().unwrap();
    assert_eq!(root.status, JobStatus::Failed);

    let second = tracker.reaper().sweep(now + Duration::minutes(1)).unwrap();
    assert!(second.timed_out.is_empty());

    let late = tracker
        .interceptor()
        .after_success(&handle, now + Duration::minutes(2))
        .unwrap();
    assert_eq!(late.outcome, TransitionOutcome::Conflicting);
    assert_eq!(late.record.status, JobStatus::Failed);
}

#[test]
fn test_late_success_after_restart_is_stale() {
    let harness = TestHarness::new();
    let tracker = harness.tracker();
    let now = Utc::now();

    let handle = tracker
        .interceptor()
        .before(
            &stage_payload("u1", "r1", "Extract Text"),
            now - Duration::hours(2),
        )
        .unwrap();
    let report = tracker.reaper().sweep(now).unwrap();
    assert_eq!(report.timed_out, vec!["u1".to_string()]);

    tracker
        .read_model()
        .restart_stage("r1", "Extract Text", now + Duration::minutes(1))
        .unwrap();

    let late = tracker
        .interceptor()
        .after_success(&handle, now + Duration::minutes(2))
        .unwrap();
    assert_eq!(late.outcome, TransitionOutcome::Stale);

    let row = tracker.registry().find_by_id("u1").unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Pending);
    assert_eq!(row.attempt, 2);
    let root = tracker.registry().find_by_id("r1").unwrap().unwrap();
    assert_eq!(root.status, JobStatus::Pending);
}

#[test]
fn test_stage_within_threshold_is_kept() {
    let harness = TestHarness::new();
    let tracker = harness.tracker();
    let now = Utc::now();

    tracker
        .interceptor()
        .before(
            &stage_payload("u1", "r1", "Extract Text"),
            now - Duration::minutes(59),
        )
        .unwrap();

    let report = tracker.reaper().sweep(now).unwrap();
    assert!(report.timed_out.is_empty());
    let root = tracker.registry().find_by_id("r1").unwrap().unwrap();
    assert_eq!(root.status, JobStatus::Processing);
}

#[test]
fn test_stage_override_extends_threshold() {
    let harness = TestHarness::with_config(
        ConfigBuilder::new()
            .stuck_threshold_secs(3600)
            .stage_timeout("Analyze Document", 4 * 3600)
            .build(),
    );
    let tracker = harness.tracker();
    let now = Utc::now();

    for (unit, stage) in [("u1", "Extract Text"), ("u2", "Analyze Document")] {
        tracker
            .interceptor()
            .before(&stage_payload(unit, "r1", stage), now - Duration::hours(2))
            .unwrap();
    }

    let report = tracker.reaper().sweep(now).unwrap();
    assert_eq!(report.timed_out, vec!["u1".to_string()]);
    let analyze = tracker.registry().find_by_id("u2").unwrap().unwrap();
    assert_eq!(analyze.status, JobStatus::Processing);
}

#[test]
fn test_scheduler_sweeps_on_trigger() {
    let harness = TestHarness::with_config(ConfigBuilder::new().sweep_interval_secs(3600).build());
    let tracker = harness.tracker();

    tracker
        .interceptor()
        .before(
            &stage_payload("u1", "r1", "Extract Text"),
            Utc::now() - Duration::hours(2),
        )
        .unwrap();

    let reaper = tracker.start_reaper();
    reaper.trigger();

    let deadline = Instant::now() + StdDuration::from_secs(5);
    let mut status = JobStatus::Processing;
    while Instant::now() < deadline {
        status = tracker.registry().find_by_id("u1").unwrap().unwrap().status;
        if status == JobStatus::Failed {
            break;
        }
        std::thread::sleep(StdDuration::from_millis(20));
    }
    reaper.shutdown();

    assert_eq!(status, JobStatus::Failed);
}
