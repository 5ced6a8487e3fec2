//! Tests for the dispatch engine: reaping, updates and cancellation

use crate::dispatch::UpdateDelta;
use crate::tests::test_utils::{slice_spec, task_spec, TestEnv};
use shared::tasks::TaskState;
use shared::SchedulerError;

#[tokio::test]
async fn test_happy_path_reap_and_complete() {
    let env = TestEnv::new();
    let caps = env.add_bot("b1", &["alpha"]).await;

    let mut spec = task_spec("compile", vec![slice_spec("alpha")]);
    spec.notify_topic = Some("projects/demo/topics/task-done".to_string());
    let summary = env.submission.submit(spec, None).await.unwrap();
    assert_eq!(summary.state, TaskState::Pending);
    let request_id = summary.request_id;

    env.clock.advance_secs(1);
    let reaped = env.reap_as("b1", &caps).await.expect("task reaped");
    assert_eq!(reaped.run.try_number, 1);
    assert_eq!(reaped.run.bot_id, "b1");
    assert_eq!(reaped.run.state, TaskState::Running);

    let summary = env.summary(request_id).await;
    assert_eq!(summary.state, TaskState::Running);
    assert_eq!(summary.bot_id.as_deref(), Some("b1"));
    assert_eq!(env.claimable_count(request_id).await, 0);

    env.clock.advance_secs(1);
    let outcome = env
        .dispatch
        .update(
            request_id,
            1,
            "b1",
            UpdateDelta {
                exit_code: Some(0),
                duration_secs: Some(1.0),
                cost_usd: Some(0.02),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.state, TaskState::Completed);
    assert!(!outcome.must_stop);

    let summary = env.summary(request_id).await;
    assert_eq!(summary.state, TaskState::Completed);
    assert_eq!(summary.exit_code, Some(0));
    assert_eq!(summary.try_number, 1);
    assert_eq!(summary.bot_id.as_deref(), Some("b1"));
    assert_eq!(summary.costs_usd, vec![0.02]);

    // The completion notification went out and left the outbox empty.
    assert_eq!(env.notifier.published_count(), 1);
    assert_eq!(env.outbox_count().await, 0);
}

#[tokio::test]
async fn test_reap_ignores_non_matching_capabilities() {
    let env = TestEnv::new();
    let caps_alpha = env.add_bot("b1", &["alpha"]).await;
    let caps_beta = env.add_bot("b2", &["beta"]).await;

    let summary = env
        .submission
        .submit(task_spec("compile", vec![slice_spec("alpha")]), None)
        .await
        .unwrap();

    assert!(env.reap_as("b2", &caps_beta).await.is_none());
    assert!(env.reap_as("b1", &caps_alpha).await.is_some());
    assert_eq!(env.claimable_count(summary.request_id).await, 0);
}

#[tokio::test]
async fn test_concurrent_reaps_have_one_winner() {
    let env = TestEnv::new();
    let caps1 = env.add_bot("b1", &["alpha"]).await;
    let caps2 = env.add_bot("b2", &["alpha"]).await;
    let caps3 = env.add_bot("b3", &["alpha"]).await;

    let summary = env
        .submission
        .submit(task_spec("compile", vec![slice_spec("alpha")]), None)
        .await
        .unwrap();
    let request_id = summary.request_id;

    let (r1, r2, r3) = tokio::join!(
        env.reap_as("b1", &caps1),
        env.reap_as("b2", &caps2),
        env.reap_as("b3", &caps3),
    );
    let winners = [r1.is_some(), r2.is_some(), r3.is_some()]
        .iter()
        .filter(|&&won| won)
        .count();
    assert_eq!(winners, 1);

    // Exactly one run with try 1 exists and the queue entry is gone.
    let run = env.run_result(request_id, 1).await;
    assert_eq!(run.state, TaskState::Running);
    assert_eq!(env.claimable_count(request_id).await, 0);
}

#[tokio::test]
async fn test_priority_and_age_ordering() {
    let env = TestEnv::new();
    let caps = env.add_bot("b1", &["alpha"]).await;

    let old_relaxed = env
        .submission
        .submit(task_spec("relaxed", vec![slice_spec("alpha")]), None)
        .await
        .unwrap();
    env.clock.advance_secs(1);
    let mut urgent_spec = task_spec("urgent", vec![slice_spec("alpha")]);
    urgent_spec.priority = 10;
    let urgent = env.submission.submit(urgent_spec, None).await.unwrap();

    // The more urgent task wins despite being newer.
    let first = env.reap_as("b1", &caps).await.unwrap();
    assert_eq!(first.request.id, urgent.request_id);

    // Finish it so the bot is idle again.
    env.dispatch
        .update(
            urgent.request_id,
            1,
            "b1",
            UpdateDelta {
                exit_code: Some(0),
                duration_secs: Some(0.1),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let second = env.reap_as("b1", &caps).await.unwrap();
    assert_eq!(second.request.id, old_relaxed.request_id);
}

#[tokio::test]
async fn test_busy_bot_cannot_claim_second_task() {
    let env = TestEnv::new();
    let caps = env.add_bot("b1", &["alpha"]).await;

    env.submission
        .submit(task_spec("first", vec![slice_spec("alpha")]), None)
        .await
        .unwrap();
    env.submission
        .submit(task_spec("second", vec![slice_spec("alpha")]), None)
        .await
        .unwrap();

    assert!(env.reap_as("b1", &caps).await.is_some());
    // Still running the first task; the claim must witness the bot busy.
    assert!(env.reap_as("b1", &caps).await.is_none());
}

#[tokio::test]
async fn test_update_wrong_bot_is_rejected() {
    let env = TestEnv::new();
    let caps = env.add_bot("b1", &["alpha"]).await;
    let summary = env
        .submission
        .submit(task_spec("compile", vec![slice_spec("alpha")]), None)
        .await
        .unwrap();
    env.reap_as("b1", &caps).await.unwrap();

    let err = env
        .dispatch
        .update(
            summary.request_id,
            1,
            "imposter",
            UpdateDelta {
                exit_code: Some(0),
                duration_secs: Some(1.0),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SchedulerError>(),
        Some(SchedulerError::BotMisbehavior(_))
    ));

    // Nothing changed.
    let run = env.run_result(summary.request_id, 1).await;
    assert_eq!(run.state, TaskState::Running);
}

#[tokio::test]
async fn test_update_exit_code_is_immutable() {
    let env = TestEnv::new();
    let caps = env.add_bot("b1", &["alpha"]).await;
    let summary = env
        .submission
        .submit(task_spec("compile", vec![slice_spec("alpha")]), None)
        .await
        .unwrap();
    env.reap_as("b1", &caps).await.unwrap();

    let done = UpdateDelta {
        exit_code: Some(0),
        duration_secs: Some(1.0),
        ..Default::default()
    };
    env.dispatch
        .update(summary.request_id, 1, "b1", done.clone())
        .await
        .unwrap();

    // An identical retry is absorbed.
    let outcome = env
        .dispatch
        .update(summary.request_id, 1, "b1", done)
        .await
        .unwrap();
    assert_eq!(outcome.state, TaskState::Completed);

    // A different exit code is refused without mutating state.
    let err = env
        .dispatch
        .update(
            summary.request_id,
            1,
            "b1",
            UpdateDelta {
                exit_code: Some(3),
                duration_secs: Some(1.0),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SchedulerError>(),
        Some(SchedulerError::BotMisbehavior(_))
    ));
    assert_eq!(env.summary(summary.request_id).await.exit_code, Some(0));
}

#[tokio::test]
async fn test_update_requires_exit_code_and_duration_together() {
    let env = TestEnv::new();
    let caps = env.add_bot("b1", &["alpha"]).await;
    let summary = env
        .submission
        .submit(task_spec("compile", vec![slice_spec("alpha")]), None)
        .await
        .unwrap();
    env.reap_as("b1", &caps).await.unwrap();

    let err = env
        .dispatch
        .update(
            summary.request_id,
            1,
            "b1",
            UpdateDelta {
                exit_code: Some(0),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SchedulerError>(),
        Some(SchedulerError::BotMisbehavior(_))
    ));
}

#[tokio::test]
async fn test_hard_timeout_synthesizes_exit_code_and_duration() {
    let env = TestEnv::new();
    let caps = env.add_bot("b1", &["alpha"]).await;
    let summary = env
        .submission
        .submit(task_spec("compile", vec![slice_spec("alpha")]), None)
        .await
        .unwrap();
    env.reap_as("b1", &caps).await.unwrap();

    env.clock.advance_secs(5);
    let outcome = env
        .dispatch
        .update(
            summary.request_id,
            1,
            "b1",
            UpdateDelta {
                hard_timeout: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.state, TaskState::TimedOut);

    let summary = env.summary(summary.request_id).await;
    assert_eq!(summary.state, TaskState::TimedOut);
    assert_eq!(summary.exit_code, Some(-1));
    assert_eq!(summary.duration_secs, Some(5.0));
}

#[tokio::test]
async fn test_cancel_pending_task() {
    let env = TestEnv::new();
    env.add_bot("b1", &["alpha"]).await;
    let summary = env
        .submission
        .submit(task_spec("compile", vec![slice_spec("alpha")]), None)
        .await
        .unwrap();

    let (ok, was_running) = env
        .dispatch
        .cancel(summary.request_id, false, None)
        .await
        .unwrap();
    assert!(ok);
    assert!(!was_running);

    let summary = env.summary(summary.request_id).await;
    assert_eq!(summary.state, TaskState::Canceled);
    assert_eq!(env.claimable_count(summary.request_id).await, 0);

    // A second cancel is a no-op on a terminal task.
    let (ok, _) = env
        .dispatch
        .cancel(summary.request_id, false, None)
        .await
        .unwrap();
    assert!(!ok);
}

#[tokio::test]
async fn test_cancel_running_without_kill_fails() {
    let env = TestEnv::new();
    let caps = env.add_bot("b1", &["alpha"]).await;
    let summary = env
        .submission
        .submit(task_spec("compile", vec![slice_spec("alpha")]), None)
        .await
        .unwrap();
    env.reap_as("b1", &caps).await.unwrap();

    let (ok, was_running) = env
        .dispatch
        .cancel(summary.request_id, false, None)
        .await
        .unwrap();
    assert!(!ok);
    assert!(was_running);
    assert_eq!(env.summary(summary.request_id).await.state, TaskState::Running);
}

#[tokio::test]
async fn test_cancel_running_is_two_phase() {
    let env = TestEnv::new();
    let caps = env.add_bot("b1", &["alpha"]).await;
    let summary = env
        .submission
        .submit(task_spec("compile", vec![slice_spec("alpha")]), None)
        .await
        .unwrap();
    let request_id = summary.request_id;
    env.reap_as("b1", &caps).await.unwrap();

    let (ok, was_running) = env.dispatch.cancel(request_id, true, None).await.unwrap();
    assert!(ok);
    assert!(was_running);

    // Phase one: the kill is pending, the state unchanged.
    let run = env.run_result(request_id, 1).await;
    assert!(run.killing);
    assert_eq!(run.state, TaskState::Running);
    assert_eq!(env.summary(request_id).await.state, TaskState::Running);

    // A progress update without a duration is told to stop.
    let outcome = env
        .dispatch
        .update(request_id, 1, "b1", UpdateDelta::default())
        .await
        .unwrap();
    assert!(outcome.must_stop);
    assert_eq!(outcome.state, TaskState::Killed);
    assert_eq!(env.summary(request_id).await.state, TaskState::Running);

    // Phase two: the stop report carries a duration.
    let outcome = env
        .dispatch
        .update(
            request_id,
            1,
            "b1",
            UpdateDelta {
                exit_code: Some(-15),
                duration_secs: Some(12.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.state, TaskState::Killed);
    assert!(!outcome.must_stop);

    let summary = env.summary(request_id).await;
    assert_eq!(summary.state, TaskState::Killed);
    assert_eq!(summary.exit_code, Some(-15));
    assert_eq!(summary.duration_secs, Some(12.0));
}

#[tokio::test]
async fn test_cancel_with_bot_id_requires_matching_bot() {
    let env = TestEnv::new();
    let caps = env.add_bot("b1", &["alpha"]).await;
    let summary = env
        .submission
        .submit(task_spec("compile", vec![slice_spec("alpha")]), None)
        .await
        .unwrap();
    env.reap_as("b1", &caps).await.unwrap();

    let (ok, was_running) = env
        .dispatch
        .cancel(summary.request_id, true, Some("other-bot"))
        .await
        .unwrap();
    assert!(!ok);
    assert!(was_running);

    let (ok, _) = env
        .dispatch
        .cancel(summary.request_id, true, Some("b1"))
        .await
        .unwrap();
    assert!(ok);
}

#[tokio::test]
async fn test_bot_kill_task_marks_bot_died() {
    let env = TestEnv::new();
    let caps = env.add_bot("b1", &["alpha"]).await;
    let summary = env
        .submission
        .submit(task_spec("compile", vec![slice_spec("alpha")]), None)
        .await
        .unwrap();
    env.reap_as("b1", &caps).await.unwrap();

    env.dispatch
        .bot_kill_task(summary.request_id, 1, "b1", "disk full")
        .await
        .unwrap();

    let run = env.run_result(summary.request_id, 1).await;
    assert_eq!(run.state, TaskState::BotDied);
    assert!(run.internal_failure);
    assert_eq!(env.summary(summary.request_id).await.state, TaskState::BotDied);

    // Repeats are ignored.
    env.dispatch
        .bot_kill_task(summary.request_id, 1, "b1", "disk full")
        .await
        .unwrap();

    // A different bot cannot kill someone else's task.
    let err = env
        .dispatch
        .bot_kill_task(summary.request_id, 1, "b2", "meddling")
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SchedulerError>(),
        Some(SchedulerError::BotMisbehavior(_))
    ));
}

#[tokio::test]
async fn test_stale_try_update_only_records_cost() {
    let env = TestEnv::new();
    let caps1 = env.add_bot("b1", &["alpha"]).await;

    let mut slice = slice_spec("alpha");
    slice.idempotent = true;
    let summary = env
        .submission
        .submit(task_spec("compile", vec![slice]), None)
        .await
        .unwrap();
    let request_id = summary.request_id;

    env.reap_as("b1", &caps1).await.unwrap();

    // b1 goes silent; the dead-bot sweep re-enqueues try 2.
    env.clock.advance_secs(7 * 60);
    assert_eq!(env.lifecycle.sweep_dead_bots().await.unwrap(), 1);

    let caps2 = env.add_bot("b2", &["alpha"]).await;
    env.reap_as("b2", &caps2).await.unwrap();
    env.dispatch
        .update(
            request_id,
            2,
            "b2",
            UpdateDelta {
                exit_code: Some(0),
                duration_secs: Some(2.0),
                cost_usd: Some(0.5),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // The first try's bot reappears; only its cost slot may change.
    env.dispatch
        .update(
            request_id,
            1,
            "b1",
            UpdateDelta {
                cost_usd: Some(0.9),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let summary = env.summary(request_id).await;
    assert_eq!(summary.state, TaskState::Completed);
    assert_eq!(summary.try_number, 2);
    assert_eq!(summary.bot_id.as_deref(), Some("b2"));
    assert_eq!(summary.costs_usd, vec![0.9, 0.5]);
}

#[tokio::test]
async fn test_retry_never_returns_to_the_failed_bot() {
    let env = TestEnv::new();
    let caps1 = env.add_bot("b1", &["alpha"]).await;

    let mut slice = slice_spec("alpha");
    slice.idempotent = true;
    let summary = env
        .submission
        .submit(task_spec("compile", vec![slice]), None)
        .await
        .unwrap();
    let request_id = summary.request_id;

    env.reap_as("b1", &caps1).await.unwrap();
    env.clock.advance_secs(7 * 60);
    env.lifecycle.sweep_dead_bots().await.unwrap();

    // The entry for try 2 is claimable, but not by the bot that failed
    // try 1.
    assert_eq!(env.claimable_count(request_id).await, 1);
    assert!(env.reap_as("b1", &caps1).await.is_none());
    assert_eq!(env.claimable_count(request_id).await, 1);

    // The denied claim left a negative-cache entry behind; wait out the
    // soft TTL before the other bot polls.
    env.clock.advance_secs(16);
    let caps2 = env.add_bot("b2", &["alpha"]).await;
    let reaped = env.reap_as("b2", &caps2).await.unwrap();
    assert_eq!(reaped.run.try_number, 2);
}

#[tokio::test]
async fn test_inline_expiration_falls_back_to_matching_slice() {
    let env = TestEnv::new();
    // The bot satisfies both slices; only matching entries are ever
    // considered by a poll, expired or not.
    let mut bot_caps = shared::capabilities::CapabilitySet::new();
    bot_caps.insert("id", "b1");
    bot_caps.insert("pool", "alpha");
    bot_caps.insert("gpu", "v100");
    env.dispatch
        .record_bot_seen("b1", "0.4.0", &bot_caps)
        .await
        .unwrap();

    let mut first = slice_spec("alpha");
    first.capabilities.insert("gpu", "v100");
    first.expiration_secs = 10;
    let second = slice_spec("alpha");
    let summary = env
        .submission
        .submit(task_spec("compile", vec![first, second]), None)
        .await
        .unwrap();
    let request_id = summary.request_id;
    assert_eq!(env.summary(request_id).await.current_slice, 0);

    // Past the first slice's deadline the poll expires it inline and
    // claims the fallback slice in the same pass.
    env.clock.advance_secs(11);
    let reaped = env
        .reap_as("b1", &bot_caps)
        .await
        .expect("fallback reaped");
    assert_eq!(reaped.run.current_slice, 1);

    let summary = env.summary(request_id).await;
    assert_eq!(summary.state, TaskState::Running);
    assert_eq!(summary.current_slice, 1);
}

#[tokio::test]
async fn test_secret_bytes_are_delivered_on_reap() {
    let env = TestEnv::new();
    let caps = env.add_bot("b1", &["alpha"]).await;

    let spec = task_spec("compile", vec![slice_spec("alpha")]);
    let summary = env
        .submission
        .submit(spec, Some(b"hunter2".to_vec()))
        .await
        .unwrap();

    let reaped = env.reap_as("b1", &caps).await.unwrap();
    assert_eq!(reaped.request.id, summary.request_id);
    assert_eq!(reaped.secret.as_deref(), Some(b"hunter2".as_ref()));
}
