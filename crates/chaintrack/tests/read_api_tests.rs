//! Read API envelopes and statistics over queued work.

mod common;

use std::sync::Arc;

use serde_json::json;

use chaintrack::api::{self, RestartRequest};
use chaintrack::chain::{ChainQueryParams, MemoryQueue, UNGROUPED_KEY};
use chaintrack::{JobStatus, StageError};
use common::{legacy_payload, stage_payload, TestHarness};

#[test]
fn test_get_chain_envelope_is_camel_case() {
    let harness = TestHarness::new();
    let tracker = harness.tracker();
    tracker
        .run_stage(&stage_payload("u1", "r1", "Process File"), |_| Ok(()))
        .unwrap();

    let value = serde_json::to_value(api::get_chain(&tracker, "r1")).unwrap();
    assert_eq!(value["success"], true);
    assert!(value.get("error").is_none());
    assert_eq!(value["data"]["status"], "completed");
    assert_eq!(value["data"]["progress"], 100);
    assert_eq!(value["data"]["steps"][0]["stageName"], "Process File");
    assert_eq!(value["data"]["steps"][0]["queue"], "documents");
}

#[test]
fn test_unclaimed_units_count_as_pending() {
    let harness = TestHarness::new();
    let queue = Arc::new(MemoryQueue::new());
    let tracker = harness.tracker_with_queue(Arc::clone(&queue));

    tracker.register_chain("r1", &["Process File"], None).unwrap();
    queue.push(stage_payload("u1", "r1", "Process File"));
    queue.push(legacy_payload("u2", Some("Extract Text"), json!({})));

    let stats = api::get_statistics(&tracker).data.unwrap();
    assert_eq!(stats.queued, 2);
    assert_eq!(stats.pending, 3);

    let pending = api::get_pending(&tracker).data.unwrap();
    assert_eq!(pending["r1"][0].id, "u1");
    assert_eq!(pending[UNGROUPED_KEY][0].stage_name, "Extract Text");

    let view = api::get_chain(&tracker, "r1").data.unwrap();
    assert_eq!(view.queued.len(), 1);

    queue.reserve("u1");
    tracker
        .run_stage(&stage_payload("u1", "r1", "Process File"), |_| Ok(()))
        .unwrap();
    let stats = api::get_statistics(&tracker).data.unwrap();
    assert_eq!(stats.queued, 1);
    assert_eq!(stats.completed, 1);
}

#[test]
fn test_restart_flow_over_api() {
    let harness = TestHarness::new();
    let tracker = harness.tracker();

    let _ = tracker.run_stage::<(), _>(&stage_payload("u1", "r1", "Convert Document"), |_| {
        Err(StageError::Failed("unsupported format".into()))
    });

    let missing = api::restart_chain(
        &tracker,
        "r1",
        &RestartRequest {
            stage_name: "Analyze Document".to_string(),
        },
    );
    assert!(!missing.success);

    let restarted = api::restart_chain(
        &tracker,
        "r1",
        &RestartRequest {
            stage_name: "Convert Document".to_string(),
        },
    );
    assert!(restarted.success);
    let view = restarted.data.unwrap();
    assert_eq!(view.status, JobStatus::Pending);
    assert_eq!(view.steps[0].status, JobStatus::Pending);

    tracker
        .run_stage(&stage_payload("u1", "r1", "Convert Document"), |_| Ok(()))
        .unwrap();
    let view = api::get_chain(&tracker, "r1").data.unwrap();
    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.steps[0].attempt, 2);
}

#[test]
fn test_list_chains_filters_by_status() {
    let harness = TestHarness::new();
    let tracker = harness.tracker();
    tracker
        .run_stage(&stage_payload("a1", "ok", "Process File"), |_| Ok(()))
        .unwrap();
    let _ = tracker.run_stage::<(), _>(&stage_payload("b1", "bad", "Process File"), |_| {
        Err(StageError::Failed("disk full".into()))
    });

    let failed = api::list_chains(
        &tracker,
        &ChainQueryParams {
            status: Some("failed".to_string()),
            ..Default::default()
        },
    )
    .data
    .unwrap();
    assert_eq!(failed.total, 1);
    assert_eq!(failed.chains[0].id, "bad");

    let page = api::list_chains(
        &tracker,
        &ChainQueryParams {
            limit: Some(1),
            ..Default::default()
        },
    )
    .data
    .unwrap();
    assert_eq!(page.total, 2);
    assert_eq!(page.chains.len(), 1);
}
