mod common;

use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use chat_subscriptions::engine::Clock;
use chat_subscriptions::errors::AppError;
use chat_subscriptions::join_client::JoinOutcome;
use chat_subscriptions::models::{IntervalMode, StatusChange, SubscriptionTask, TaskProgress, TaskStatus};
use chat_subscriptions::store::{MemoryStore, TaskStore};

use common::{fast_pacing, slow_pacing, targets, FlakyStore, Harness, Step, OWNER};

const ACCOUNT: i64 = 1001;

fn assert_counters(task: &SubscriptionTask) {
    assert!(0 <= task.successful_count);
    assert!(task.successful_count <= task.current_index);
    assert!(task.current_index <= task.total_chats);
    assert_eq!(task.total_chats as usize, task.chat_targets.len());
}

#[tokio::test]
async fn every_target_joined_completes_the_task() {
    let h = Harness::new(fast_pacing());
    let group = h.group(&["@alpha_chat", "@bravo_chat", "@charlie_chat"]).await;

    let task = h
        .engine
        .start_task(OWNER, ACCOUNT, group.group_id, IntervalMode::Safe)
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.total_chats, 3);

    let done = h
        .wait_for(task.task_id, |t| t.status == TaskStatus::Completed)
        .await;
    assert_eq!(done.current_index, 3);
    assert_eq!(done.successful_count, 3);
    assert_eq!(done.flood_count, 0);
    assert!(done.started_at.is_some());
    assert!(done.completed_at.is_some());
    assert!(done.result.as_deref().unwrap().contains("Joined 3 of 3"));
    assert_counters(&done);
    assert_eq!(
        h.join.calls(),
        targets(&["@alpha_chat", "@bravo_chat", "@charlie_chat"])
    );
    assert!(h.engine.describe(done).estimated_completion.is_none());
}

#[tokio::test]
async fn flood_wait_holds_until_the_deadline_passes() {
    let h = Harness::new(fast_pacing());
    let group = h.group(&["@alpha_chat", "@bravo_chat", "@charlie_chat"]).await;
    h.join.script(
        "@bravo_chat",
        vec![Step::Reply(JoinOutcome::FloodWait(Duration::from_secs(600)))],
    );
    let started_at = h.clock.now();

    let task = h
        .engine
        .start_task(OWNER, ACCOUNT, group.group_id, IntervalMode::Safe)
        .await
        .unwrap();
    let held = h
        .wait_for(task.task_id, |t| t.status == TaskStatus::FloodWait)
        .await;
    assert_eq!(held.current_index, 1);
    assert_eq!(held.successful_count, 1);
    assert_eq!(held.flood_count, 1);
    assert_eq!(
        held.flood_wait_until,
        Some(started_at + ChronoDuration::seconds(600))
    );

    h.clock.advance(ChronoDuration::seconds(300));
    let err = h.engine.continue_task(OWNER, task.task_id).await.unwrap_err();
    assert!(matches!(err, AppError::NotReady { .. }));
    assert_eq!(h.task(task.task_id).await.status, TaskStatus::FloodWait);

    h.clock.advance(ChronoDuration::seconds(301));
    let resumed = h.engine.continue_task(OWNER, task.task_id).await.unwrap();
    assert_eq!(resumed.status, TaskStatus::Processing);
    assert_eq!(resumed.flood_wait_until, None);

    let done = h
        .wait_for(task.task_id, |t| t.status == TaskStatus::Completed)
        .await;
    assert_eq!(done.current_index, 3);
    assert_eq!(done.successful_count, 3);
    assert_eq!(done.flood_count, 1);
    assert_eq!(
        h.join.calls(),
        targets(&["@alpha_chat", "@bravo_chat", "@bravo_chat", "@charlie_chat"])
    );
}

#[tokio::test]
async fn permanent_failure_skips_the_target() {
    let h = Harness::new(fast_pacing());
    let group = h.group(&["@alpha_chat", "@bravo_chat", "@charlie_chat"]).await;
    h.join.script(
        "@alpha_chat",
        vec![Step::Reply(JoinOutcome::PermanentFailure("INVITE_HASH_EXPIRED".into()))],
    );

    let task = h
        .engine
        .start_task(OWNER, ACCOUNT, group.group_id, IntervalMode::Aggressive)
        .await
        .unwrap();
    let done = h
        .wait_for(task.task_id, |t| t.status == TaskStatus::Completed)
        .await;
    assert_eq!(done.current_index, 3);
    assert_eq!(done.successful_count, 2);
    assert_counters(&done);
    assert_eq!(h.join.call_count(), 3);
}

#[tokio::test]
async fn pause_during_pacing_sleep_then_resume_continues_in_place() {
    let h = Harness::new(slow_pacing());
    let group = h.group(&["@alpha_chat", "@bravo_chat", "@charlie_chat"]).await;

    let task = h
        .engine
        .start_task(OWNER, ACCOUNT, group.group_id, IntervalMode::Safe)
        .await
        .unwrap();
    h.wait_for(task.task_id, |t| t.current_index == 1).await;

    let paused = h.engine.pause_task(OWNER, task.task_id).await.unwrap();
    assert_eq!(paused.status, TaskStatus::Pending);
    assert_eq!(paused.current_index, 1);

    // A paused task is not resumed by anything but `resume`.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.join.call_count(), 1);
    assert!(matches!(
        h.engine.continue_task(OWNER, task.task_id).await,
        Err(AppError::InvalidState { .. })
    ));

    let resumed = h.engine.resume_task(OWNER, task.task_id).await.unwrap();
    assert_eq!(resumed.status, TaskStatus::Processing);
    assert_eq!(resumed.current_index, 1);

    let after = h.wait_for(task.task_id, |t| t.current_index == 2).await;
    assert_eq!(after.successful_count, 2);
    assert_eq!(h.join.calls(), targets(&["@alpha_chat", "@bravo_chat"]));

    h.engine.cancel_task(OWNER, task.task_id).await.unwrap();
}

#[tokio::test]
async fn cancelled_task_cannot_be_retried_or_continued() {
    let h = Harness::new(slow_pacing());
    let group = h.group(&["@alpha_chat", "@bravo_chat"]).await;

    let task = h
        .engine
        .start_task(OWNER, ACCOUNT, group.group_id, IntervalMode::Safe)
        .await
        .unwrap();
    h.wait_for(task.task_id, |t| {
        t.status == TaskStatus::Processing && t.current_index == 1
    })
    .await;

    let cancelled = h.engine.cancel_task(OWNER, task.task_id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());

    for err in [
        h.engine.retry_task(OWNER, task.task_id).await.unwrap_err(),
        h.engine.continue_task(OWNER, task.task_id).await.unwrap_err(),
        h.engine.pause_task(OWNER, task.task_id).await.unwrap_err(),
        h.engine.resume_task(OWNER, task.task_id).await.unwrap_err(),
    ] {
        assert!(matches!(
            err,
            AppError::InvalidState {
                status: TaskStatus::Cancelled,
                ..
            }
        ));
    }
    assert_eq!(h.task(task.task_id).await, cancelled);

    // The account is free again.
    let next = h
        .engine
        .start_task(OWNER, ACCOUNT, group.group_id, IntervalMode::Safe)
        .await
        .unwrap();
    h.wait_for(next.task_id, |t| t.current_index == 1).await;
    h.engine.cancel_task(OWNER, next.task_id).await.unwrap();
}

#[tokio::test]
async fn retry_resumes_a_failed_task_without_repeating_joins() {
    let h = Harness::new(fast_pacing());
    let group = h.group(&["@alpha_chat", "@bravo_chat", "@charlie_chat"]).await;
    h.join.script("@bravo_chat", vec![Step::Fail("session offline")]);

    let task = h
        .engine
        .start_task(OWNER, ACCOUNT, group.group_id, IntervalMode::Safe)
        .await
        .unwrap();
    let failed = h
        .wait_for(task.task_id, |t| t.status == TaskStatus::Failed)
        .await;
    assert_eq!(failed.current_index, 1);
    assert_eq!(failed.successful_count, 1);
    assert!(failed.error_message.as_deref().unwrap().contains("session offline"));

    let retried = h.engine.retry_task(OWNER, task.task_id).await.unwrap();
    assert_eq!(retried.current_index, 1);
    assert_eq!(retried.error_message, None);

    let done = h
        .wait_for(task.task_id, |t| t.status == TaskStatus::Completed)
        .await;
    assert_eq!(done.successful_count, 3);
    assert_eq!(
        h.join.calls(),
        targets(&["@alpha_chat", "@bravo_chat", "@bravo_chat", "@charlie_chat"])
    );

    // Completed is terminal.
    assert!(matches!(
        h.engine.retry_task(OWNER, task.task_id).await,
        Err(AppError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn concurrent_starts_for_one_account_admit_exactly_one() {
    let h = Harness::new(slow_pacing());
    let group = h.group(&["@alpha_chat", "@bravo_chat"]).await;

    let (first, second) = tokio::join!(
        h.engine
            .start_task(OWNER, ACCOUNT, group.group_id, IntervalMode::Safe),
        h.engine
            .start_task(OWNER, ACCOUNT, group.group_id, IntervalMode::Aggressive),
    );

    let results = [first, second];
    let started: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(AppError::Conflict(_))))
        .count();
    assert_eq!(started.len(), 1);
    assert_eq!(conflicts, 1);

    // Another account is unaffected.
    let other = h
        .engine
        .start_task(OWNER, ACCOUNT + 1, group.group_id, IntervalMode::Safe)
        .await
        .unwrap();

    h.engine.cancel_task(OWNER, started[0].task_id).await.unwrap();
    h.engine.cancel_task(OWNER, other.task_id).await.unwrap();
}

#[tokio::test]
async fn group_edits_do_not_touch_running_snapshots() {
    let h = Harness::new(slow_pacing());
    let group = h.group(&["@alpha_chat", "@bravo_chat"]).await;

    let task = h
        .engine
        .start_task(OWNER, ACCOUNT, group.group_id, IntervalMode::Safe)
        .await
        .unwrap();

    h.groups
        .add_targets(OWNER, group.group_id, &["@charlie_chat".to_string()])
        .await
        .unwrap();
    h.groups
        .remove_targets(OWNER, group.group_id, &["@alpha_chat".to_string()])
        .await
        .unwrap();
    assert!(matches!(
        h.groups.delete(OWNER, group.group_id).await,
        Err(AppError::Conflict(_))
    ));

    let current = h.task(task.task_id).await;
    assert_eq!(current.total_chats, 2);
    assert_eq!(current.chat_targets, targets(&["@alpha_chat", "@bravo_chat"]));

    h.engine.cancel_task(OWNER, task.task_id).await.unwrap();
    h.groups.delete(OWNER, group.group_id).await.unwrap();
    assert_eq!(h.task(task.task_id).await.total_chats, 2);
}

#[tokio::test]
async fn start_validates_group_and_ownership() {
    let h = Harness::new(fast_pacing());
    let group = h.group(&["@alpha_chat"]).await;

    assert!(matches!(
        h.engine
            .start_task(OWNER + 1, ACCOUNT, group.group_id, IntervalMode::Safe)
            .await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        h.engine
            .start_task(OWNER, 0, group.group_id, IntervalMode::Safe)
            .await,
        Err(AppError::Validation(_))
    ));
    assert!(matches!(
        h.engine.get_task(OWNER, uuid::Uuid::new_v4()).await,
        Err(AppError::NotFound(_))
    ));
    assert!(h.engine.list_tasks(OWNER, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn interrupted_tasks_are_recovered_at_startup() {
    let first = Harness::new(fast_pacing());
    let group = first
        .group(&["@alpha_chat", "@bravo_chat", "@charlie_chat"])
        .await;

    // State a crashed process would leave behind: picked up, one join done.
    let now = first.clock.now();
    let task = SubscriptionTask::from_group(&group, ACCOUNT, IntervalMode::Safe, now);
    first.store.insert_task(&task).await.unwrap();
    first
        .store
        .transition(
            task.task_id,
            &[TaskStatus::Pending],
            &StatusChange::PickedUp { at: now },
            now,
        )
        .await
        .unwrap()
        .unwrap();
    first
        .store
        .save_progress(
            task.task_id,
            TaskProgress {
                current_index: 1,
                successful_count: 1,
                flood_count: 0,
                hold_until: None,
            },
            now,
        )
        .await
        .unwrap();

    let restarted = Harness::with_store(first.store.clone(), fast_pacing());
    assert_eq!(restarted.engine.recover_interrupted().await.unwrap(), 1);

    let done = restarted
        .wait_for(task.task_id, |t| t.status == TaskStatus::Completed)
        .await;
    assert_eq!(done.successful_count, 3);
    assert_eq!(
        restarted.join.calls(),
        targets(&["@bravo_chat", "@charlie_chat"])
    );
}

#[tokio::test]
async fn elapsed_flood_waits_resume_automatically() {
    let h = Harness::new(fast_pacing());
    let group = h.group(&["@alpha_chat", "@bravo_chat"]).await;
    h.join.script(
        "@alpha_chat",
        vec![Step::Reply(JoinOutcome::FloodWait(Duration::from_secs(30)))],
    );

    let task = h
        .engine
        .start_task(OWNER, ACCOUNT, group.group_id, IntervalMode::Safe)
        .await
        .unwrap();
    h.wait_for(task.task_id, |t| t.status == TaskStatus::FloodWait)
        .await;

    assert_eq!(h.engine.resume_due_flood_waits().await.unwrap(), 0);
    h.clock.advance(ChronoDuration::seconds(31));
    assert_eq!(h.engine.resume_due_flood_waits().await.unwrap(), 1);

    let done = h
        .wait_for(task.task_id, |t| t.status == TaskStatus::Completed)
        .await;
    assert_eq!(done.current_index, 2);
    assert_eq!(done.flood_count, 1);
}

#[tokio::test]
async fn list_is_newest_first_and_filterable() {
    let h = Harness::new(slow_pacing());
    let group = h.group(&["@alpha_chat", "@bravo_chat"]).await;

    let older = h
        .engine
        .start_task(OWNER, ACCOUNT, group.group_id, IntervalMode::Safe)
        .await
        .unwrap();
    h.engine.cancel_task(OWNER, older.task_id).await.unwrap();

    h.clock.advance(ChronoDuration::seconds(1));
    let newer = h
        .engine
        .start_task(OWNER, ACCOUNT + 1, group.group_id, IntervalMode::Safe)
        .await
        .unwrap();

    let all = h.engine.list_tasks(OWNER, None).await.unwrap();
    let ids: Vec<_> = all.iter().map(|t| t.task_id).collect();
    assert_eq!(ids, vec![newer.task_id, older.task_id]);

    let cancelled = h
        .engine
        .list_tasks(OWNER, Some(TaskStatus::Cancelled))
        .await
        .unwrap();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].task_id, older.task_id);
    assert!(h.engine.list_tasks(OWNER + 1, None).await.unwrap().is_empty());

    h.engine.cancel_task(OWNER, newer.task_id).await.unwrap();
}

#[tokio::test]
async fn pausing_a_flood_wait_keeps_the_penalty() {
    let h = Harness::new(fast_pacing());
    let group = h.group(&["@alpha_chat", "@bravo_chat"]).await;
    h.join.script(
        "@alpha_chat",
        vec![Step::Reply(JoinOutcome::FloodWait(Duration::from_secs(3600)))],
    );

    let task = h
        .engine
        .start_task(OWNER, ACCOUNT, group.group_id, IntervalMode::Safe)
        .await
        .unwrap();
    let held = h
        .wait_for(task.task_id, |t| t.status == TaskStatus::FloodWait)
        .await;
    let until = held.flood_wait_until.unwrap();

    let paused = h.engine.pause_task(OWNER, task.task_id).await.unwrap();
    assert_eq!(paused.status, TaskStatus::Pending);
    assert_eq!(paused.flood_wait_until, None);
    assert_eq!(paused.hold_until, Some(until));

    match h.engine.resume_task(OWNER, task.task_id).await {
        Err(AppError::NotReady { until: reported }) => assert_eq!(reported, until),
        other => panic!("expected not_ready, got {:?}", other),
    }
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(h.task(task.task_id).await.status, TaskStatus::Pending);
    assert_eq!(h.join.call_count(), 1);

    h.clock.advance(ChronoDuration::seconds(3601));
    let resumed = h.engine.resume_task(OWNER, task.task_id).await.unwrap();
    assert_eq!(resumed.status, TaskStatus::Processing);
    assert_eq!(resumed.updated_at, h.clock.now());

    let done = h
        .wait_for(task.task_id, |t| t.status == TaskStatus::Completed)
        .await;
    assert_eq!(done.successful_count, 2);
    assert_eq!(done.flood_count, 1);
    assert_eq!(
        h.join.calls(),
        targets(&["@alpha_chat", "@alpha_chat", "@bravo_chat"])
    );
}

#[tokio::test]
async fn pause_during_an_attempt_keeps_its_outcome() {
    let h = Harness::new(slow_pacing());
    let group = h.group(&["@alpha_chat", "@bravo_chat"]).await;
    let gate = Arc::new(Notify::new());
    h.join.script(
        "@alpha_chat",
        vec![Step::Gated(gate.clone(), JoinOutcome::Joined)],
    );

    let task = h
        .engine
        .start_task(OWNER, ACCOUNT, group.group_id, IntervalMode::Safe)
        .await
        .unwrap();
    h.wait_for_calls(1).await;

    let paused = h.engine.pause_task(OWNER, task.task_id).await.unwrap();
    assert_eq!(paused.status, TaskStatus::Pending);
    assert_eq!(paused.current_index, 0);

    gate.notify_one();
    let after = h.wait_for(task.task_id, |t| t.current_index == 1).await;
    assert_eq!(after.status, TaskStatus::Pending);
    assert_eq!(after.successful_count, 1);
    assert_counters(&after);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.task(task.task_id).await.status, TaskStatus::Pending);
    assert_eq!(h.join.call_count(), 1);

    h.engine.cancel_task(OWNER, task.task_id).await.unwrap();
}

#[tokio::test]
async fn flood_wait_during_a_paused_attempt_is_still_honoured() {
    let h = Harness::new(fast_pacing());
    let group = h.group(&["@alpha_chat", "@bravo_chat"]).await;
    let gate = Arc::new(Notify::new());
    h.join.script(
        "@alpha_chat",
        vec![Step::Gated(
            gate.clone(),
            JoinOutcome::FloodWait(Duration::from_secs(3600)),
        )],
    );

    let task = h
        .engine
        .start_task(OWNER, ACCOUNT, group.group_id, IntervalMode::Safe)
        .await
        .unwrap();
    h.wait_for_calls(1).await;
    h.engine.pause_task(OWNER, task.task_id).await.unwrap();

    gate.notify_one();
    let after = h.wait_for(task.task_id, |t| t.flood_count == 1).await;
    let until = h.clock.now() + ChronoDuration::seconds(3600);
    assert_eq!(after.status, TaskStatus::Pending);
    assert_eq!(after.current_index, 0);
    assert_eq!(after.flood_wait_until, None);
    assert_eq!(after.hold_until, Some(until));

    assert!(matches!(
        h.engine.resume_task(OWNER, task.task_id).await,
        Err(AppError::NotReady { .. })
    ));
    assert_eq!(h.join.call_count(), 1);

    h.clock.advance(ChronoDuration::seconds(3601));
    h.engine.resume_task(OWNER, task.task_id).await.unwrap();
    let done = h
        .wait_for(task.task_id, |t| t.status == TaskStatus::Completed)
        .await;
    assert_eq!(done.successful_count, 2);
    assert_eq!(
        h.join.calls(),
        targets(&["@alpha_chat", "@alpha_chat", "@bravo_chat"])
    );
}

#[tokio::test]
async fn pause_racing_the_pickup_leaves_the_task_pending() {
    let store = MemoryStore::new();
    let tasks = Arc::new(FlakyStore::with_pickup_delay(
        store.clone(),
        Duration::from_millis(100),
    ));
    let h = Harness::with_task_store(store, tasks, fast_pacing());
    let group = h.group(&["@alpha_chat", "@bravo_chat"]).await;

    let task = h
        .engine
        .start_task(OWNER, ACCOUNT, group.group_id, IntervalMode::Safe)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let paused = h.engine.pause_task(OWNER, task.task_id).await.unwrap();
    assert_eq!(paused.status, TaskStatus::Pending);

    tokio::time::sleep(Duration::from_millis(250)).await;
    let after = h.task(task.task_id).await;
    assert_eq!(after.status, TaskStatus::Pending);
    assert_eq!(after.current_index, 0);
    assert_eq!(h.join.call_count(), 0);

    let resumed = h.engine.resume_task(OWNER, task.task_id).await.unwrap();
    assert_eq!(resumed.status, TaskStatus::Processing);
    let done = h
        .wait_for(task.task_id, |t| t.status == TaskStatus::Completed)
        .await;
    assert_eq!(done.successful_count, 2);
    assert_eq!(h.join.calls(), targets(&["@alpha_chat", "@bravo_chat"]));
}

#[tokio::test]
async fn cancel_racing_the_pickup_is_final() {
    let store = MemoryStore::new();
    let tasks = Arc::new(FlakyStore::with_pickup_delay(
        store.clone(),
        Duration::from_millis(100),
    ));
    let h = Harness::with_task_store(store, tasks, fast_pacing());
    let group = h.group(&["@alpha_chat"]).await;

    let task = h
        .engine
        .start_task(OWNER, ACCOUNT, group.group_id, IntervalMode::Safe)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let cancelled = h.engine.cancel_task(OWNER, task.task_id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(h.task(task.task_id).await.status, TaskStatus::Cancelled);
    assert_eq!(h.join.call_count(), 0);
}

#[tokio::test]
async fn one_broken_task_does_not_stop_the_flood_wait_sweep() {
    let store = MemoryStore::new();
    let tasks = Arc::new(FlakyStore::new(store.clone()));
    let h = Harness::with_task_store(store, tasks.clone(), fast_pacing());
    let group = h.group(&["@alpha_chat", "@bravo_chat"]).await;
    h.join.script(
        "@alpha_chat",
        vec![
            Step::Reply(JoinOutcome::FloodWait(Duration::from_secs(30))),
            Step::Reply(JoinOutcome::FloodWait(Duration::from_secs(30))),
        ],
    );

    let broken = h
        .engine
        .start_task(OWNER, ACCOUNT, group.group_id, IntervalMode::Safe)
        .await
        .unwrap();
    h.wait_for(broken.task_id, |t| t.status == TaskStatus::FloodWait)
        .await;
    let healthy = h
        .engine
        .start_task(OWNER, ACCOUNT + 1, group.group_id, IntervalMode::Safe)
        .await
        .unwrap();
    h.wait_for(healthy.task_id, |t| t.status == TaskStatus::FloodWait)
        .await;

    tasks.break_task(broken.task_id);
    h.clock.advance(ChronoDuration::seconds(31));
    assert_eq!(h.engine.resume_due_flood_waits().await.unwrap(), 1);

    let done = h
        .wait_for(healthy.task_id, |t| t.status == TaskStatus::Completed)
        .await;
    assert_eq!(done.successful_count, 2);
    assert_eq!(h.task(broken.task_id).await.status, TaskStatus::FloodWait);
}
