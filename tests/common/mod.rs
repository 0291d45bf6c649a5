#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

use chat_subscriptions::engine::{Clock, ManualClock, PacingConfig, SubscriptionEngine};
use chat_subscriptions::errors::{AppError, Result};
use chat_subscriptions::join_client::{JoinClient, JoinError, JoinOutcome};
use chat_subscriptions::models::{
    ChatGroup, ChatTarget, StatusChange, SubscriptionTask, TaskProgress, TaskStatus,
};
use chat_subscriptions::services::ChatGroupService;
use chat_subscriptions::store::{MemoryStore, TaskStore};

pub const OWNER: i64 = 7;

pub enum Step {
    Reply(JoinOutcome),
    Fail(&'static str),
    /// Block the attempt until the gate is notified, then reply.
    Gated(Arc<Notify>, JoinOutcome),
}

/// Join client that replays per-target scripts and records every call.
/// Targets without a script (or with an exhausted one) are joined.
#[derive(Default)]
pub struct ScriptedJoinClient {
    script: Mutex<HashMap<ChatTarget, VecDeque<Step>>>,
    calls: Mutex<Vec<(i64, ChatTarget)>>,
}

impl ScriptedJoinClient {
    pub fn script(&self, target: &str, steps: Vec<Step>) {
        let target: ChatTarget = target.parse().expect("valid target");
        self.script
            .lock()
            .unwrap()
            .entry(target)
            .or_default()
            .extend(steps);
    }

    pub fn calls(&self) -> Vec<ChatTarget> {
        self.calls.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl JoinClient for ScriptedJoinClient {
    async fn attempt_join(
        &self,
        account_id: i64,
        target: &ChatTarget,
    ) -> std::result::Result<JoinOutcome, JoinError> {
        self.calls.lock().unwrap().push((account_id, target.clone()));
        let step = self
            .script
            .lock()
            .unwrap()
            .get_mut(target)
            .and_then(|steps| steps.pop_front());
        match step {
            None => Ok(JoinOutcome::Joined),
            Some(Step::Reply(outcome)) => Ok(outcome),
            Some(Step::Fail(message)) => Err(JoinError::InvalidResponse(message.to_string())),
            Some(Step::Gated(gate, outcome)) => {
                gate.notified().await;
                Ok(outcome)
            }
        }
    }
}

/// Task store that can delay run-loop pickups and fail every transition of
/// chosen tasks. Everything else goes straight to the wrapped store.
pub struct FlakyStore {
    inner: MemoryStore,
    pickup_delay: Duration,
    broken: Mutex<HashSet<Uuid>>,
}

impl FlakyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self::with_pickup_delay(inner, Duration::ZERO)
    }

    pub fn with_pickup_delay(inner: MemoryStore, pickup_delay: Duration) -> Self {
        Self {
            inner,
            pickup_delay,
            broken: Mutex::new(HashSet::new()),
        }
    }

    pub fn break_task(&self, task_id: Uuid) {
        self.broken.lock().unwrap().insert(task_id);
    }
}

#[async_trait]
impl TaskStore for FlakyStore {
    async fn insert_task(&self, task: &SubscriptionTask) -> Result<SubscriptionTask> {
        self.inner.insert_task(task).await
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<SubscriptionTask>> {
        self.inner.get_task(task_id).await
    }

    async fn list_tasks(
        &self,
        owner_user_id: i64,
        status: Option<TaskStatus>,
    ) -> Result<Vec<SubscriptionTask>> {
        self.inner.list_tasks(owner_user_id, status).await
    }

    async fn find_active_task(
        &self,
        owner_user_id: i64,
        account_id: i64,
    ) -> Result<Option<SubscriptionTask>> {
        self.inner.find_active_task(owner_user_id, account_id).await
    }

    async fn find_due_flood_waits(&self, now: DateTime<Utc>) -> Result<Vec<SubscriptionTask>> {
        self.inner.find_due_flood_waits(now).await
    }

    async fn find_interrupted(&self) -> Result<Vec<SubscriptionTask>> {
        self.inner.find_interrupted().await
    }

    async fn transition(
        &self,
        task_id: Uuid,
        from: &[TaskStatus],
        change: &StatusChange,
        now: DateTime<Utc>,
    ) -> Result<Option<SubscriptionTask>> {
        if self.broken.lock().unwrap().contains(&task_id) {
            return Err(AppError::DatabaseError("connection reset".to_string()));
        }
        if matches!(change, StatusChange::PickedUp { .. }) {
            tokio::time::sleep(self.pickup_delay).await;
        }
        self.inner.transition(task_id, from, change, now).await
    }

    async fn save_progress(
        &self,
        task_id: Uuid,
        progress: TaskProgress,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.inner.save_progress(task_id, progress, now).await
    }
}

/// Pacing short enough that whole tasks finish within a test.
pub fn fast_pacing() -> PacingConfig {
    PacingConfig {
        safe: Duration::from_millis(2),
        aggressive: Duration::from_millis(1),
        jitter: 0.0,
    }
}

/// Pacing long enough that a worker is reliably parked in its sleep.
pub fn slow_pacing() -> PacingConfig {
    PacingConfig {
        safe: Duration::from_secs(60),
        aggressive: Duration::from_secs(60),
        jitter: 0.0,
    }
}

pub fn targets(items: &[&str]) -> Vec<ChatTarget> {
    items.iter().map(|s| s.parse().expect("valid target")).collect()
}

pub struct Harness {
    pub store: MemoryStore,
    pub clock: Arc<ManualClock>,
    pub join: Arc<ScriptedJoinClient>,
    pub engine: Arc<SubscriptionEngine>,
    pub groups: ChatGroupService,
}

impl Harness {
    pub fn new(pacing: PacingConfig) -> Self {
        Self::with_store(MemoryStore::new(), pacing)
    }

    pub fn with_store(store: MemoryStore, pacing: PacingConfig) -> Self {
        let tasks = Arc::new(store.clone());
        Self::with_task_store(store, tasks, pacing)
    }

    /// `tasks` must front `store`; reads in the harness go to `store`.
    pub fn with_task_store(
        store: MemoryStore,
        tasks: Arc<dyn TaskStore>,
        pacing: PacingConfig,
    ) -> Self {
        let clock = Arc::new(ManualClock::default());
        let join = Arc::new(ScriptedJoinClient::default());
        let engine = SubscriptionEngine::new(
            tasks,
            Arc::new(store.clone()),
            join.clone(),
            clock.clone() as Arc<dyn Clock>,
            pacing,
        );
        let groups = ChatGroupService::new(Arc::new(store.clone()), clock.clone());
        Self {
            store,
            clock,
            join,
            engine,
            groups,
        }
    }

    pub async fn group(&self, links: &[&str]) -> ChatGroup {
        let links: Vec<String> = links.iter().map(|s| s.to_string()).collect();
        self.groups
            .create(OWNER, "test group", None, &links)
            .await
            .expect("group created")
    }

    pub async fn task(&self, task_id: Uuid) -> SubscriptionTask {
        self.store
            .get_task(task_id)
            .await
            .expect("store read")
            .expect("task exists")
    }

    /// Poll until the join client has been called `count` times.
    pub async fn wait_for_calls(&self, count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.join.call_count() < count {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {} join calls", count);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Poll the store until `done` holds for the task.
    pub async fn wait_for<F>(&self, task_id: Uuid, done: F) -> SubscriptionTask
    where
        F: Fn(&SubscriptionTask) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let task = self.task(task_id).await;
            if done(&task) {
                return task;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for task {}: {:?}", task_id, task);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
