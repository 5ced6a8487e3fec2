//! Tests for task entities and the summary/run state copying rules

use crate::capabilities::CapabilitySet;
use crate::tasks::{ResultSummary, RunResult, TaskRequest, TaskSlice, TaskState, TaskToRun};
use crate::utils::compose_request_id;
use std::collections::BTreeMap;

pub(crate) fn sample_slice(pool: &str) -> TaskSlice {
    TaskSlice {
        capabilities: CapabilitySet::from_pairs([("pool", pool)]),
        expiration_secs: 60,
        wait_for_capacity: false,
        idempotent: false,
        command: vec!["echo".to_string(), "hi".to_string()],
        env: BTreeMap::new(),
        inputs_ref: None,
        execution_timeout_secs: 300,
        io_timeout_secs: 60,
        grace_period_secs: 30,
    }
}

pub(crate) fn sample_request(created_ms: i64, slices: Vec<TaskSlice>) -> TaskRequest {
    let expiration: i64 = slices.iter().map(|s| s.expiration_secs as i64).sum();
    TaskRequest {
        id: compose_request_id(created_ms, 1),
        name: "sample".to_string(),
        priority: 50,
        created_ts_ms: created_ms,
        expiration_ts_ms: created_ms + expiration * 1000,
        slices,
        parent_run_id: None,
        notify_topic: None,
        notify_userdata: None,
        tags: vec![],
        has_secret: false,
    }
}

#[test]
fn test_state_terminality() {
    assert!(!TaskState::Pending.is_terminal());
    assert!(!TaskState::Running.is_terminal());
    for state in [
        TaskState::Completed,
        TaskState::TimedOut,
        TaskState::Killed,
        TaskState::Canceled,
        TaskState::Expired,
        TaskState::BotDied,
        TaskState::NoResource,
    ] {
        assert!(state.is_terminal(), "{state} should be terminal");
    }
    assert!(TaskState::BotDied.is_exceptional());
    assert!(!TaskState::Completed.is_exceptional());
}

#[test]
fn test_state_integer_round_trip() {
    for state in [
        TaskState::Pending,
        TaskState::Running,
        TaskState::Completed,
        TaskState::TimedOut,
        TaskState::Killed,
        TaskState::Canceled,
        TaskState::Expired,
        TaskState::BotDied,
        TaskState::NoResource,
    ] {
        assert_eq!(TaskState::from_i64(state.as_i64()).unwrap(), state);
    }
    assert!(TaskState::from_i64(0).is_err());
}

#[test]
fn test_properties_hash_is_stable_and_sensitive() {
    let slice = sample_slice("default");
    let h1 = slice.properties_hash(None);
    let h2 = slice.properties_hash(None);
    assert_eq!(h1, h2);

    let mut other = sample_slice("default");
    other.command.push("--verbose".to_string());
    assert_ne!(h1, other.properties_hash(None));

    // Secret bytes participate in the hash.
    assert_ne!(h1, slice.properties_hash(Some(b"secret")));
}

#[test]
fn test_to_run_queue_number_uses_request_creation_time() {
    let request = sample_request(1_700_000_000_000, vec![sample_slice("a"), sample_slice("b")]);
    let first = TaskToRun::new(&request, 1, 0, request.created_ts_ms);
    // Re-enqueued 30 seconds later for the fallback slice.
    let fallback = TaskToRun::new(&request, 1, 1, request.created_ts_ms + 30_000);

    assert_eq!(first.queue_number, fallback.queue_number);
    assert!(fallback.expiration_ts_ms > first.expiration_ts_ms);
}

#[test]
fn test_termination_detection() {
    let mut slice = sample_slice("default");
    slice.command.clear();
    slice.capabilities = CapabilitySet::from_pairs([("id", "bot-1")]);
    let request = sample_request(1_700_000_000_000, vec![slice]);
    assert!(request.is_termination());

    let normal = sample_request(1_700_000_000_000, vec![sample_slice("default")]);
    assert!(!normal.is_termination());
}

#[test]
fn test_set_from_run_result_copies_and_publishes_hash() {
    let mut slice = sample_slice("default");
    slice.idempotent = true;
    let request = sample_request(1_700_000_000_000, vec![slice]);
    let to_run = TaskToRun::new(&request, 1, 0, request.created_ts_ms);
    let mut summary = ResultSummary::new(&request);

    let bot_caps = CapabilitySet::from_pairs([("pool", "default"), ("id", "bot-1")]);
    let mut run = RunResult::new(
        &request,
        &to_run,
        1,
        "bot-1",
        "1.0.0",
        &bot_caps,
        request.created_ts_ms + 1_000,
    );
    run.state = TaskState::Completed;
    run.exit_code = Some(0);
    run.duration_secs = Some(1.5);
    run.completed_ts_ms = Some(request.created_ts_ms + 2_500);
    run.cost_usd = 0.25;
    run.modified_ts_ms = request.created_ts_ms + 2_500;

    summary.set_from_run_result(&run, &request);

    assert_eq!(summary.state, TaskState::Completed);
    assert_eq!(summary.try_number, 1);
    assert_eq!(summary.bot_id.as_deref(), Some("bot-1"));
    assert_eq!(summary.exit_code, Some(0));
    assert_eq!(summary.costs_usd, vec![0.25]);
    assert!(summary.properties_hash.is_some());
}

#[test]
fn test_failed_run_does_not_publish_hash() {
    let mut slice = sample_slice("default");
    slice.idempotent = true;
    let request = sample_request(1_700_000_000_000, vec![slice]);
    let to_run = TaskToRun::new(&request, 1, 0, request.created_ts_ms);
    let mut summary = ResultSummary::new(&request);

    let bot_caps = CapabilitySet::from_pairs([("pool", "default")]);
    let mut run = RunResult::new(&request, &to_run, 1, "bot-1", "1.0.0", &bot_caps, 0);
    run.state = TaskState::Completed;
    run.exit_code = Some(3);
    run.duration_secs = Some(0.1);

    summary.set_from_run_result(&run, &request);
    assert!(summary.failure());
    assert!(summary.properties_hash.is_none());
}

#[test]
fn test_reset_to_pending_keeps_bot_and_try() {
    let request = sample_request(1_700_000_000_000, vec![sample_slice("default")]);
    let to_run = TaskToRun::new(&request, 1, 0, request.created_ts_ms);
    let mut summary = ResultSummary::new(&request);
    let bot_caps = CapabilitySet::from_pairs([("pool", "default")]);
    let run = RunResult::new(&request, &to_run, 1, "bot-1", "1.0.0", &bot_caps, 0);
    summary.set_from_run_result(&run, &request);

    summary.reset_to_pending();

    assert_eq!(summary.state, TaskState::Pending);
    assert_eq!(summary.try_number, 1);
    assert_eq!(summary.bot_id.as_deref(), Some("bot-1"));
    assert!(summary.started_ts_ms.is_none());
    assert!(summary.exit_code.is_none());
}

#[test]
fn test_stale_try_cost_slot_grows() {
    let request = sample_request(1_700_000_000_000, vec![sample_slice("default")]);
    let to_run = TaskToRun::new(&request, 2, 0, request.created_ts_ms);
    let mut summary = ResultSummary::new(&request);
    let bot_caps = CapabilitySet::from_pairs([("pool", "default")]);
    let mut run = RunResult::new(&request, &to_run, 2, "bot-2", "1.0.0", &bot_caps, 0);
    run.cost_usd = 0.5;

    summary.set_from_run_result(&run, &request);
    assert_eq!(summary.costs_usd, vec![0.0, 0.5]);
}
