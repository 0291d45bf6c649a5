//! Durable state for chat groups and subscription tasks.
//!
//! Two implementations: [`PgStore`] for deployments and [`MemoryStore`] for
//! development and tests. Both enforce the one-active-task-per-account rule
//! inside a single write, never as a separate read followed by an insert.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::Result;
use crate::models::{ChatGroup, StatusChange, SubscriptionTask, TaskProgress, TaskStatus};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupDeletion {
    Deleted,
    NotFound,
    /// A pending, processing or flood-waited task still points at the group.
    Referenced,
}

#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn insert_group(&self, group: &ChatGroup) -> Result<ChatGroup>;

    async fn get_group(&self, group_id: Uuid) -> Result<Option<ChatGroup>>;

    /// Newest first.
    async fn list_groups(&self, owner_user_id: i64) -> Result<Vec<ChatGroup>>;

    /// Read-modify-write of one group as a single locked step, so concurrent
    /// edits never overwrite each other. An error from `edit` aborts the
    /// write and is returned as is.
    async fn modify_group(
        &self,
        group_id: Uuid,
        edit: &(dyn for<'g> Fn(&'g mut ChatGroup) -> Result<()> + Send + Sync),
    ) -> Result<ChatGroup>;

    async fn delete_group(&self, group_id: Uuid) -> Result<GroupDeletion>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Fails with `Conflict` when the account already has an active task.
    async fn insert_task(&self, task: &SubscriptionTask) -> Result<SubscriptionTask>;

    async fn get_task(&self, task_id: Uuid) -> Result<Option<SubscriptionTask>>;

    /// Newest first, optionally narrowed to one status.
    async fn list_tasks(
        &self,
        owner_user_id: i64,
        status: Option<TaskStatus>,
    ) -> Result<Vec<SubscriptionTask>>;

    async fn find_active_task(
        &self,
        owner_user_id: i64,
        account_id: i64,
    ) -> Result<Option<SubscriptionTask>>;

    async fn find_due_flood_waits(&self, now: DateTime<Utc>) -> Result<Vec<SubscriptionTask>>;

    /// Tasks left `processing` by a previous process.
    async fn find_interrupted(&self) -> Result<Vec<SubscriptionTask>>;

    /// Compare-and-set: applies `change` only while the task's status is one
    /// of `from`. Returns `None` (and leaves the row untouched) otherwise.
    /// `now` stamps `updated_at`.
    async fn transition(
        &self,
        task_id: Uuid,
        from: &[TaskStatus],
        change: &StatusChange,
        now: DateTime<Utc>,
    ) -> Result<Option<SubscriptionTask>>;

    /// Persist run-loop counters regardless of status. Never lowers
    /// `current_index`.
    async fn save_progress(
        &self,
        task_id: Uuid,
        progress: TaskProgress,
        now: DateTime<Utc>,
    ) -> Result<()>;
}
