use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{GroupDeletion, GroupStore, TaskStore};
use crate::errors::{AppError, Result};
use crate::models::{ChatGroup, StatusChange, SubscriptionTask, TaskProgress, TaskStatus};

#[derive(Default)]
struct MemoryState {
    groups: HashMap<Uuid, ChatGroup>,
    tasks: HashMap<Uuid, SubscriptionTask>,
}

/// Process-local store. Groups and tasks share one lock so the
/// group-reference and active-task checks see a consistent view.
#[derive(Default, Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first<T, F>(mut items: Vec<T>, created_at: F) -> Vec<T>
where
    F: Fn(&T) -> DateTime<Utc>,
{
    items.sort_by_key(|item| std::cmp::Reverse(created_at(item)));
    items
}

#[async_trait]
impl GroupStore for MemoryStore {
    async fn insert_group(&self, group: &ChatGroup) -> Result<ChatGroup> {
        let mut state = self.state.write().await;
        if state.groups.contains_key(&group.group_id) {
            return Err(AppError::Conflict(format!(
                "group {} already exists",
                group.group_id
            )));
        }
        state.groups.insert(group.group_id, group.clone());
        Ok(group.clone())
    }

    async fn get_group(&self, group_id: Uuid) -> Result<Option<ChatGroup>> {
        Ok(self.state.read().await.groups.get(&group_id).cloned())
    }

    async fn list_groups(&self, owner_user_id: i64) -> Result<Vec<ChatGroup>> {
        let state = self.state.read().await;
        let groups = state
            .groups
            .values()
            .filter(|g| g.owner_user_id == owner_user_id)
            .cloned()
            .collect();
        Ok(newest_first(groups, |g| g.created_at))
    }

    async fn modify_group(
        &self,
        group_id: Uuid,
        edit: &(dyn for<'g> Fn(&'g mut ChatGroup) -> Result<()> + Send + Sync),
    ) -> Result<ChatGroup> {
        let mut state = self.state.write().await;
        let stored = state
            .groups
            .get_mut(&group_id)
            .ok_or_else(|| AppError::NotFound(format!("group {}", group_id)))?;
        let mut edited = stored.clone();
        edit(&mut edited)?;
        *stored = edited.clone();
        Ok(edited)
    }

    async fn delete_group(&self, group_id: Uuid) -> Result<GroupDeletion> {
        let mut state = self.state.write().await;
        if !state.groups.contains_key(&group_id) {
            return Ok(GroupDeletion::NotFound);
        }
        let referenced = state
            .tasks
            .values()
            .any(|t| t.group_id == group_id && t.status.is_active());
        if referenced {
            return Ok(GroupDeletion::Referenced);
        }
        state.groups.remove(&group_id);
        Ok(GroupDeletion::Deleted)
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, task: &SubscriptionTask) -> Result<SubscriptionTask> {
        let mut state = self.state.write().await;
        let busy = state.tasks.values().any(|t| {
            t.owner_user_id == task.owner_user_id
                && t.account_id == task.account_id
                && t.status.is_active()
        });
        if busy {
            return Err(AppError::Conflict(format!(
                "account {} already has an active subscription task",
                task.account_id
            )));
        }
        state.tasks.insert(task.task_id, task.clone());
        Ok(task.clone())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<SubscriptionTask>> {
        Ok(self.state.read().await.tasks.get(&task_id).cloned())
    }

    async fn list_tasks(
        &self,
        owner_user_id: i64,
        status: Option<TaskStatus>,
    ) -> Result<Vec<SubscriptionTask>> {
        let state = self.state.read().await;
        let tasks = state
            .tasks
            .values()
            .filter(|t| t.owner_user_id == owner_user_id)
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        Ok(newest_first(tasks, |t| t.created_at))
    }

    async fn find_active_task(
        &self,
        owner_user_id: i64,
        account_id: i64,
    ) -> Result<Option<SubscriptionTask>> {
        let state = self.state.read().await;
        Ok(state
            .tasks
            .values()
            .find(|t| {
                t.owner_user_id == owner_user_id
                    && t.account_id == account_id
                    && t.status.is_active()
            })
            .cloned())
    }

    async fn find_due_flood_waits(&self, now: DateTime<Utc>) -> Result<Vec<SubscriptionTask>> {
        let state = self.state.read().await;
        Ok(state
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::FloodWait
                    && t.flood_wait_until.map_or(false, |until| until <= now)
            })
            .cloned()
            .collect())
    }

    async fn find_interrupted(&self) -> Result<Vec<SubscriptionTask>> {
        let state = self.state.read().await;
        Ok(state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Processing)
            .cloned()
            .collect())
    }

    async fn transition(
        &self,
        task_id: Uuid,
        from: &[TaskStatus],
        change: &StatusChange,
        now: DateTime<Utc>,
    ) -> Result<Option<SubscriptionTask>> {
        let mut state = self.state.write().await;
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return Ok(None);
        };
        if !from.contains(&task.status) {
            return Ok(None);
        }
        change.apply(task, now);
        Ok(Some(task.clone()))
    }

    async fn save_progress(
        &self,
        task_id: Uuid,
        progress: TaskProgress,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| AppError::NotFound(format!("task {}", task_id)))?;
        if progress.current_index < task.current_index {
            return Ok(());
        }
        task.current_index = progress.current_index.min(task.total_chats);
        task.successful_count = progress.successful_count.min(task.current_index);
        task.flood_count = progress.flood_count;
        if progress.hold_until.is_some() {
            task.hold_until = progress.hold_until;
        }
        task.updated_at = now;
        Ok(())
    }
}
