//! Subscription engine: the per-account run-loops plus the operator
//! controls that steer them.
//!
//! Every status change goes through [`TaskStore::transition`], a
//! compare-and-set on the current status, so an operator's pause/cancel and
//! the run-loop's own transitions can race without either overwriting the
//! other. Cancellation tokens only stop the loop; the one status write a
//! halted worker makes is handing back a pickup that a pause overtook.
//!
//! Control operations for one account are serialised on a per-account lock
//! and halt the worker before writing status, so a worker scheduled by one
//! operation can never outlive a later pause or cancel.

use dashmap::DashMap;
use std::sync::{atomic::AtomicU64, Arc};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::errors::{AppError, Result};
use crate::join_client::JoinClient;
use crate::models::{
    IntervalMode, StatusChange, SubscriptionTask, TaskResponse, TaskStatus,
};
use crate::store::{GroupStore, TaskStore};

mod clock;
mod pacing;
mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use pacing::PacingConfig;

type AccountKey = (i64, i64);

pub struct SubscriptionEngine {
    tasks: Arc<dyn TaskStore>,
    groups: Arc<dyn GroupStore>,
    join_client: Arc<dyn JoinClient>,
    clock: Arc<dyn Clock>,
    pacing: PacingConfig,
    /// One lock per (owner, account); held by the running loop.
    accounts: DashMap<AccountKey, Arc<Mutex<()>>>,
    /// One lock per (owner, account); held by control operations.
    controls: DashMap<AccountKey, Arc<Mutex<()>>>,
    /// Live worker per task, tagged with a generation so a finishing worker
    /// never removes its successor's entry.
    workers: DashMap<Uuid, (u64, CancellationToken)>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

impl SubscriptionEngine {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        groups: Arc<dyn GroupStore>,
        join_client: Arc<dyn JoinClient>,
        clock: Arc<dyn Clock>,
        pacing: PacingConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            tasks,
            groups,
            join_client,
            clock,
            pacing,
            accounts: DashMap::new(),
            controls: DashMap::new(),
            workers: DashMap::new(),
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn pacing(&self) -> &PacingConfig {
        &self.pacing
    }

    /// Snapshot the group and queue a new task for the account.
    pub async fn start_task(
        self: &Arc<Self>,
        owner_user_id: i64,
        account_id: i64,
        group_id: Uuid,
        interval_mode: IntervalMode,
    ) -> Result<SubscriptionTask> {
        if account_id <= 0 {
            return Err(AppError::Validation("account_id must be positive".to_string()));
        }

        let group = self
            .groups
            .get_group(group_id)
            .await?
            .filter(|g| g.owner_user_id == owner_user_id)
            .ok_or_else(|| AppError::NotFound(format!("group {}", group_id)))?;

        if group.chat_targets.is_empty() {
            return Err(AppError::Validation(format!(
                "group {} has no chat targets",
                group_id
            )));
        }

        let _controls = self.lock_controls(owner_user_id, account_id).await;
        if let Some(active) = self.tasks.find_active_task(owner_user_id, account_id).await? {
            return Err(AppError::Conflict(format!(
                "account {} already has an active task {} ({})",
                account_id, active.task_id, active.status
            )));
        }

        // The store re-checks atomically; the lookup above only names the
        // blocking task.
        let task = SubscriptionTask::from_group(&group, account_id, interval_mode, self.clock.now());
        let task = self.tasks.insert_task(&task).await?;

        info!(
            task_id = %task.task_id,
            account_id,
            total = task.total_chats,
            mode = interval_mode.as_str(),
            "Subscription task created"
        );
        self.schedule(&task);
        Ok(task)
    }

    /// Stop the loop after the current attempt and park the task in
    /// `pending`; `resume_task` picks it up again.
    pub async fn pause_task(&self, owner_user_id: i64, task_id: Uuid) -> Result<SubscriptionTask> {
        let (current, _controls) = self.lock_task_controls(owner_user_id, task_id).await?;
        if current.status.is_active() {
            self.halt_worker(task_id);
        }
        let task = self
            .control(current, "pause", &TaskStatus::ACTIVE, StatusChange::Paused)
            .await?;
        info!(%task_id, index = task.current_index, "Task paused");
        Ok(task)
    }

    /// Re-enter the run-loop for a paused task. Refused with `NotReady`
    /// while a flood-wait penalty from before the pause is still running.
    pub async fn resume_task(
        self: &Arc<Self>,
        owner_user_id: i64,
        task_id: Uuid,
    ) -> Result<SubscriptionTask> {
        let (current, _controls) = self.lock_task_controls(owner_user_id, task_id).await?;
        if current.status == TaskStatus::Pending {
            if let Some(until) = current.held_until(self.clock.now()) {
                return Err(AppError::NotReady { until });
            }
        }

        let task = self
            .control(
                current,
                "resume",
                &[TaskStatus::Pending],
                StatusChange::PickedUp {
                    at: self.clock.now(),
                },
            )
            .await?;
        info!(%task_id, index = task.current_index, "Task resumed");
        self.schedule(&task);
        Ok(task)
    }

    pub async fn cancel_task(&self, owner_user_id: i64, task_id: Uuid) -> Result<SubscriptionTask> {
        let (current, _controls) = self.lock_task_controls(owner_user_id, task_id).await?;
        if current.status.is_active() {
            self.halt_worker(task_id);
        }
        let task = self
            .control(
                current,
                "cancel",
                &TaskStatus::ACTIVE,
                StatusChange::Cancelled {
                    at: self.clock.now(),
                },
            )
            .await?;
        info!(%task_id, index = task.current_index, "Task cancelled");
        Ok(task)
    }

    /// Resume a failed task at `current_index`; counters are kept.
    pub async fn retry_task(
        self: &Arc<Self>,
        owner_user_id: i64,
        task_id: Uuid,
    ) -> Result<SubscriptionTask> {
        let (current, _controls) = self.lock_task_controls(owner_user_id, task_id).await?;
        let task = self
            .control(current, "retry", &[TaskStatus::Failed], StatusChange::Resumed)
            .await?;
        info!(%task_id, index = task.current_index, "Task retried");
        self.schedule(&task);
        Ok(task)
    }

    /// Leave `flood_wait` once the platform's deadline has passed.
    pub async fn continue_task(
        self: &Arc<Self>,
        owner_user_id: i64,
        task_id: Uuid,
    ) -> Result<SubscriptionTask> {
        let (current, _controls) = self.lock_task_controls(owner_user_id, task_id).await?;
        if current.status != TaskStatus::FloodWait {
            return Err(AppError::InvalidState {
                status: current.status,
                operation: "continue",
            });
        }
        if let Some(until) = current.held_until(self.clock.now()) {
            return Err(AppError::NotReady { until });
        }

        let task = self
            .control(
                current,
                "continue",
                &[TaskStatus::FloodWait],
                StatusChange::Resumed,
            )
            .await?;
        info!(%task_id, index = task.current_index, "Task continued after flood wait");
        self.schedule(&task);
        Ok(task)
    }

    pub async fn get_task(&self, owner_user_id: i64, task_id: Uuid) -> Result<SubscriptionTask> {
        self.owned_task(owner_user_id, task_id).await
    }

    pub async fn list_tasks(
        &self,
        owner_user_id: i64,
        status: Option<TaskStatus>,
    ) -> Result<Vec<SubscriptionTask>> {
        self.tasks.list_tasks(owner_user_id, status).await
    }

    /// Attach the fields derived at read time.
    pub fn describe(&self, task: SubscriptionTask) -> TaskResponse {
        let now = self.clock.now();
        TaskResponse {
            progress_percent: task.progress_percent(),
            estimated_completion: self.pacing.estimate_completion(&task, now),
            task,
        }
    }

    /// Re-enter the run-loop for tasks a previous process left `processing`.
    pub async fn recover_interrupted(self: &Arc<Self>) -> Result<usize> {
        let interrupted = self.tasks.find_interrupted().await?;
        for task in &interrupted {
            info!(task_id = %task.task_id, index = task.current_index, "Recovering interrupted task");
            self.schedule(task);
        }
        Ok(interrupted.len())
    }

    /// Continue every flood-waited task whose deadline has passed. A task
    /// that cannot be resumed is logged and left for the next sweep.
    pub async fn resume_due_flood_waits(self: &Arc<Self>) -> Result<usize> {
        let due = self.tasks.find_due_flood_waits(self.clock.now()).await?;
        let mut resumed = 0;
        for task in due {
            match self.resume_flood_wait(&task).await {
                Ok(true) => resumed += 1,
                Ok(false) => {}
                Err(e) => warn!(task_id = %task.task_id, "Automatic flood-wait resume failed: {}", e),
            }
        }
        Ok(resumed)
    }

    async fn resume_flood_wait(self: &Arc<Self>, task: &SubscriptionTask) -> Result<bool> {
        let _controls = self.lock_controls(task.owner_user_id, task.account_id).await;
        let change = self
            .tasks
            .transition(
                task.task_id,
                &[TaskStatus::FloodWait],
                &StatusChange::Resumed,
                self.clock.now(),
            )
            .await?;
        match change {
            Some(task) => {
                info!(task_id = %task.task_id, "Flood wait elapsed, resuming automatically");
                self.schedule(&task);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn spawn_flood_wait_resumer(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = engine.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = engine.resume_due_flood_waits().await {
                            error!("Flood-wait sweep failed: {}", e);
                        }
                    }
                }
            }
        })
    }

    /// Stop every run-loop without touching task status; interrupted tasks
    /// stay `processing` and are recovered on the next boot.
    pub fn shutdown(&self) {
        info!(workers = self.workers.len(), "Stopping subscription workers");
        self.shutdown.cancel();
    }

    async fn owned_task(&self, owner_user_id: i64, task_id: Uuid) -> Result<SubscriptionTask> {
        self.tasks
            .get_task(task_id)
            .await?
            .filter(|t| t.owner_user_id == owner_user_id)
            .ok_or_else(|| AppError::NotFound(format!("task {}", task_id)))
    }

    async fn lock_controls(&self, owner_user_id: i64, account_id: i64) -> OwnedMutexGuard<()> {
        let lock = self
            .controls
            .entry((owner_user_id, account_id))
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Take the task's account control lock and re-read the task under it.
    async fn lock_task_controls(
        &self,
        owner_user_id: i64,
        task_id: Uuid,
    ) -> Result<(SubscriptionTask, OwnedMutexGuard<()>)> {
        let task = self.owned_task(owner_user_id, task_id).await?;
        let guard = self.lock_controls(owner_user_id, task.account_id).await;
        let task = self.owned_task(owner_user_id, task_id).await?;
        Ok((task, guard))
    }

    async fn control(
        &self,
        current: SubscriptionTask,
        operation: &'static str,
        from: &[TaskStatus],
        change: StatusChange,
    ) -> Result<SubscriptionTask> {
        if !from.contains(&current.status) {
            return Err(AppError::InvalidState {
                status: current.status,
                operation,
            });
        }

        let task_id = current.task_id;
        match self
            .tasks
            .transition(task_id, from, &change, self.clock.now())
            .await?
        {
            Some(task) => Ok(task),
            None => {
                // Lost a race with the run-loop.
                let latest = self.owned_task(current.owner_user_id, task_id).await?;
                warn!(%task_id, status = %latest.status, operation, "Control operation lost a race");
                Err(AppError::InvalidState {
                    status: latest.status,
                    operation,
                })
            }
        }
    }

    fn halt_worker(&self, task_id: Uuid) {
        if let Some(entry) = self.workers.get(&task_id) {
            entry.1.cancel();
        }
    }
}
