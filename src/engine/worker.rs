use std::sync::{atomic::Ordering, Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use super::SubscriptionEngine;
use crate::errors::Result;
use crate::join_client::JoinOutcome;
use crate::models::{StatusChange, SubscriptionTask, TaskProgress, TaskStatus};

/// Minimum flood-wait hold; the deadline must lie strictly in the future.
const MIN_FLOOD_WAIT: std::time::Duration = std::time::Duration::from_secs(1);

impl SubscriptionEngine {
    /// Hand a task to its account's run-loop.
    ///
    /// At most one run-loop per account executes at a time: a newly scheduled
    /// task waits for the account lock, and that wait is cancellable like any
    /// other suspension point. A worker already registered for the task is
    /// superseded: its token is cancelled and the new worker starts once it
    /// has let go of the account.
    pub(crate) fn schedule(self: &Arc<Self>, task: &SubscriptionTask) {
        let task_id = task.task_id;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();
        if let Some((_, previous)) = self.workers.insert(task_id, (generation, token.clone())) {
            debug!(%task_id, "Superseding previous worker");
            previous.cancel();
        }

        let account_lock = self
            .accounts
            .entry((task.owner_user_id, task.account_id))
            .or_default()
            .clone();
        let engine = Arc::clone(self);
        let span = tracing::info_span!(
            "subscription_worker",
            %task_id,
            account_id = task.account_id
        );

        tokio::spawn(
            async move {
                let guard = tokio::select! {
                    guard = account_lock.lock_owned() => guard,
                    _ = token.cancelled() => {
                        debug!("Cancelled while waiting for the account");
                        engine.release(task_id, generation);
                        return;
                    }
                };
                engine.run_task(task_id, generation, &token).await;
                drop(guard);
                engine.release(task_id, generation);
            }
            .instrument(span),
        );
    }

    fn release(&self, task_id: Uuid, generation: u64) {
        self.workers
            .remove_if(&task_id, |_, (current, _)| *current == generation);
    }

    async fn run_task(&self, task_id: Uuid, generation: u64, token: &CancellationToken) {
        if token.is_cancelled() {
            return;
        }

        let now = self.clock.now();
        let picked_up = self
            .tasks
            .transition(
                task_id,
                &[TaskStatus::Pending, TaskStatus::Processing],
                &StatusChange::PickedUp { at: now },
                now,
            )
            .await;

        let task = match picked_up {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!("Task is no longer runnable");
                return;
            }
            Err(e) => {
                error!("Failed to pick up task: {}", e);
                return;
            }
        };

        if token.is_cancelled() {
            self.undo_pickup(task_id, generation).await;
            return;
        }

        info!(
            index = task.current_index,
            total = task.total_chats,
            mode = task.interval_mode.as_str(),
            "Run-loop started"
        );

        if let Err(e) = self.drive(task, token).await {
            error!("Run-loop aborted: {}", e);
            let failed = StatusChange::Failed {
                error_message: format!("Internal error: {}", e),
            };
            if let Err(e) = self
                .tasks
                .transition(task_id, &[TaskStatus::Processing], &failed, self.clock.now())
                .await
            {
                error!("Failed to mark task as failed: {}", e);
            }
        }
    }

    /// A pause or cancel halted this worker while its pickup was in flight.
    /// Put the record back to `pending` unless the halt came from shutdown or
    /// from a successor worker taking over.
    async fn undo_pickup(&self, task_id: Uuid, generation: u64) {
        let superseded = self
            .workers
            .get(&task_id)
            .map_or(true, |entry| entry.0 != generation);
        if superseded || self.shutdown.is_cancelled() {
            return;
        }

        match self
            .tasks
            .transition(
                task_id,
                &[TaskStatus::Processing],
                &StatusChange::Paused,
                self.clock.now(),
            )
            .await
        {
            Ok(Some(_)) => info!("Pickup overtaken by a pause, task left pending"),
            Ok(None) => debug!("Pickup overtaken by a control operation"),
            Err(e) => error!("Failed to hand back picked-up task: {}", e),
        }
    }

    /// Walk the snapshot from `current_index`. Returns when the task is
    /// finished, flood-waited, failed, or the token is cancelled.
    async fn drive(&self, task: SubscriptionTask, token: &CancellationToken) -> Result<()> {
        let task_id = task.task_id;
        let mut progress = task.progress();

        let now = self.clock.now();
        if let Some(until) = task.held_until(now) {
            let wait = (until - now).to_std().unwrap_or_default();
            info!(%until, "Waiting out flood-wait penalty before the next attempt");
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Run-loop halted during flood-wait hold");
                    return Ok(());
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        loop {
            if progress.current_index >= task.total_chats {
                self.complete(&task, progress).await?;
                return Ok(());
            }
            if token.is_cancelled() {
                info!(index = progress.current_index, "Run-loop halted");
                return Ok(());
            }

            let index = progress.current_index;
            let target = &task.chat_targets[index as usize];

            // The attempt itself is not raced against the token: an in-flight
            // join finishes and its outcome is recorded.
            match self.join_client.attempt_join(task.account_id, target).await {
                Ok(JoinOutcome::Joined) | Ok(JoinOutcome::AlreadyMember) => {
                    progress.successful_count += 1;
                    progress.current_index += 1;
                    self.tasks
                        .save_progress(task_id, progress, self.clock.now())
                        .await?;
                    debug!(index, %target, "Joined");
                }
                Ok(JoinOutcome::PermanentFailure(reason)) => {
                    progress.current_index += 1;
                    self.tasks
                        .save_progress(task_id, progress, self.clock.now())
                        .await?;
                    warn!(index, %target, %reason, "Skipping target");
                }
                Ok(JoinOutcome::FloodWait(wait)) => {
                    let hold = chrono::Duration::from_std(wait.max(MIN_FLOOD_WAIT))
                        .unwrap_or_else(|_| chrono::Duration::days(365));
                    let now = self.clock.now();
                    let until = now + hold;

                    // The deadline is saved with the counters so it survives a
                    // pause that overtook this attempt.
                    progress.flood_count += 1;
                    progress.hold_until = Some(until);
                    self.tasks.save_progress(task_id, progress, now).await?;

                    let held = self
                        .tasks
                        .transition(
                            task_id,
                            &[TaskStatus::Processing],
                            &StatusChange::FloodWait { until },
                            now,
                        )
                        .await?;
                    match held {
                        Some(_) => warn!(index, %target, %until, "Flood wait, run-loop stopped"),
                        None => warn!(index, %target, %until, "Flood wait recorded on a halted task"),
                    }
                    return Ok(());
                }
                Err(e) => {
                    error!(index, %target, "Join attempt failed: {}", e);
                    self.tasks
                        .transition(
                            task_id,
                            &[TaskStatus::Processing],
                            &StatusChange::Failed {
                                error_message: e.to_string(),
                            },
                            self.clock.now(),
                        )
                        .await?;
                    return Ok(());
                }
            }

            if progress.current_index >= task.total_chats {
                continue;
            }

            let delay = self
                .pacing
                .next_delay(task.interval_mode, &mut rand::thread_rng());
            debug!(delay_secs = delay.as_secs_f64(), "Sleeping before next attempt");
            tokio::select! {
                _ = token.cancelled() => {
                    info!(index = progress.current_index, "Run-loop halted during pacing sleep");
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn complete(&self, task: &SubscriptionTask, progress: TaskProgress) -> Result<()> {
        let skipped = progress.current_index - progress.successful_count;
        let result = format!(
            "Joined {} of {} chats ({} skipped, {} flood waits)",
            progress.successful_count, task.total_chats, skipped, progress.flood_count
        );
        let completed = self
            .tasks
            .transition(
                task.task_id,
                &[TaskStatus::Processing],
                &StatusChange::Completed {
                    result: result.clone(),
                    at: self.clock.now(),
                },
                self.clock.now(),
            )
            .await?;
        if completed.is_some() {
            info!(%result, "Task completed");
        }
        Ok(())
    }
}
