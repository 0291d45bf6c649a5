use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::{GroupDeletion, GroupStore, TaskStore};
use crate::errors::{AppError, Result};
use crate::models::{
    ChatGroup, ChatTarget, StatusChange, SubscriptionTask, TaskProgress, TaskStatus,
};

const GROUP_COLUMNS: &str =
    "group_id, owner_user_id, name, description, chat_targets, created_at, updated_at";

const TASK_COLUMNS: &str = r#"
    task_id, owner_user_id, account_id, group_id, interval_mode, status,
    chat_targets, total_chats, current_index, successful_count, flood_count,
    flood_wait_until, hold_until, result, error_message, created_at, started_at,
    completed_at, updated_at
"#;

#[derive(Debug, FromRow)]
struct ChatGroupRow {
    group_id: Uuid,
    owner_user_id: i64,
    name: String,
    description: Option<String>,
    chat_targets: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct TaskRow {
    task_id: Uuid,
    owner_user_id: i64,
    account_id: i64,
    group_id: Uuid,
    interval_mode: String,
    status: String,
    chat_targets: Vec<String>,
    total_chats: i32,
    current_index: i32,
    successful_count: i32,
    flood_count: i32,
    flood_wait_until: Option<DateTime<Utc>>,
    hold_until: Option<DateTime<Utc>>,
    result: Option<String>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

fn decode_targets(raw: Vec<String>) -> Result<Vec<ChatTarget>> {
    raw.into_iter()
        .map(|s| {
            s.parse::<ChatTarget>()
                .map_err(|e| AppError::DatabaseError(format!("corrupt chat target: {}", e)))
        })
        .collect()
}

fn encode_targets(targets: &[ChatTarget]) -> Vec<String> {
    targets.iter().map(ToString::to_string).collect()
}

impl TryFrom<ChatGroupRow> for ChatGroup {
    type Error = AppError;

    fn try_from(row: ChatGroupRow) -> Result<Self> {
        Ok(ChatGroup {
            group_id: row.group_id,
            owner_user_id: row.owner_user_id,
            name: row.name,
            description: row.description,
            chat_targets: decode_targets(row.chat_targets)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl TryFrom<TaskRow> for SubscriptionTask {
    type Error = AppError;

    fn try_from(row: TaskRow) -> Result<Self> {
        Ok(SubscriptionTask {
            task_id: row.task_id,
            owner_user_id: row.owner_user_id,
            account_id: row.account_id,
            group_id: row.group_id,
            interval_mode: row.interval_mode.parse().map_err(AppError::DatabaseError)?,
            status: row.status.parse().map_err(AppError::DatabaseError)?,
            chat_targets: decode_targets(row.chat_targets)?,
            total_chats: row.total_chats,
            current_index: row.current_index,
            successful_count: row.successful_count,
            flood_count: row.flood_count,
            flood_wait_until: row.flood_wait_until,
            hold_until: row.hold_until,
            result: row.result,
            error_message: row.error_message,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
        })
    }
}

fn status_strings(statuses: &[TaskStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GroupStore for PgStore {
    async fn insert_group(&self, group: &ChatGroup) -> Result<ChatGroup> {
        let row = sqlx::query_as::<_, ChatGroupRow>(&format!(
            r#"
            INSERT INTO chat_groups (group_id, owner_user_id, name, description, chat_targets, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {}
            "#,
            GROUP_COLUMNS
        ))
        .bind(group.group_id)
        .bind(group.owner_user_id)
        .bind(&group.name)
        .bind(&group.description)
        .bind(encode_targets(&group.chat_targets))
        .bind(group.created_at)
        .bind(group.updated_at)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get_group(&self, group_id: Uuid) -> Result<Option<ChatGroup>> {
        sqlx::query_as::<_, ChatGroupRow>(&format!(
            "SELECT {} FROM chat_groups WHERE group_id = $1",
            GROUP_COLUMNS
        ))
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?
        .map(ChatGroup::try_from)
        .transpose()
    }

    async fn list_groups(&self, owner_user_id: i64) -> Result<Vec<ChatGroup>> {
        sqlx::query_as::<_, ChatGroupRow>(&format!(
            "SELECT {} FROM chat_groups WHERE owner_user_id = $1 ORDER BY created_at DESC",
            GROUP_COLUMNS
        ))
        .bind(owner_user_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ChatGroup::try_from)
        .collect()
    }

    async fn modify_group(
        &self,
        group_id: Uuid,
        edit: &(dyn for<'g> Fn(&'g mut ChatGroup) -> Result<()> + Send + Sync),
    ) -> Result<ChatGroup> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, ChatGroupRow>(&format!(
            "SELECT {} FROM chat_groups WHERE group_id = $1 FOR UPDATE",
            GROUP_COLUMNS
        ))
        .bind(group_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("group {}", group_id)))?;

        let mut group = ChatGroup::try_from(row)?;
        edit(&mut group)?;

        let row = sqlx::query_as::<_, ChatGroupRow>(&format!(
            r#"
            UPDATE chat_groups
            SET name = $2, description = $3, chat_targets = $4, updated_at = $5
            WHERE group_id = $1
            RETURNING {}
            "#,
            GROUP_COLUMNS
        ))
        .bind(group_id)
        .bind(&group.name)
        .bind(&group.description)
        .bind(encode_targets(&group.chat_targets))
        .bind(group.updated_at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        row.try_into()
    }

    async fn delete_group(&self, group_id: Uuid) -> Result<GroupDeletion> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query_scalar::<_, Uuid>(
            "SELECT group_id FROM chat_groups WHERE group_id = $1 FOR UPDATE",
        )
        .bind(group_id)
        .fetch_optional(&mut *tx)
        .await?;
        if exists.is_none() {
            return Ok(GroupDeletion::NotFound);
        }

        let referenced = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM subscription_tasks
                WHERE group_id = $1 AND status = ANY($2)
            )
            "#,
        )
        .bind(group_id)
        .bind(status_strings(&TaskStatus::ACTIVE))
        .fetch_one(&mut *tx)
        .await?;
        if referenced {
            return Ok(GroupDeletion::Referenced);
        }

        sqlx::query("DELETE FROM chat_groups WHERE group_id = $1")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(GroupDeletion::Deleted)
    }
}

#[async_trait]
impl TaskStore for PgStore {
    async fn insert_task(&self, task: &SubscriptionTask) -> Result<SubscriptionTask> {
        // uq_subscription_tasks_active_account turns the one-active-task rule
        // into a single conditional write.
        let inserted = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            INSERT INTO subscription_tasks (
                task_id, owner_user_id, account_id, group_id, interval_mode, status,
                chat_targets, total_chats, current_index, successful_count, flood_count,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12)
            RETURNING {}
            "#,
            TASK_COLUMNS
        ))
        .bind(task.task_id)
        .bind(task.owner_user_id)
        .bind(task.account_id)
        .bind(task.group_id)
        .bind(task.interval_mode.as_str())
        .bind(task.status.as_str())
        .bind(encode_targets(&task.chat_targets))
        .bind(task.total_chats)
        .bind(task.current_index)
        .bind(task.successful_count)
        .bind(task.flood_count)
        .bind(task.created_at)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(row) => row.try_into(),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(AppError::Conflict(format!(
                    "account {} already has an active subscription task",
                    task.account_id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<SubscriptionTask>> {
        sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM subscription_tasks WHERE task_id = $1",
            TASK_COLUMNS
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?
        .map(SubscriptionTask::try_from)
        .transpose()
    }

    async fn list_tasks(
        &self,
        owner_user_id: i64,
        status: Option<TaskStatus>,
    ) -> Result<Vec<SubscriptionTask>> {
        let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {} FROM subscription_tasks WHERE owner_user_id = ",
            TASK_COLUMNS
        ));
        query_builder.push_bind(owner_user_id);
        if let Some(status) = status {
            query_builder.push(" AND status = ");
            query_builder.push_bind(status.as_str());
        }
        query_builder.push(" ORDER BY created_at DESC");

        query_builder
            .build_query_as::<TaskRow>()
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(SubscriptionTask::try_from)
            .collect()
    }

    async fn find_active_task(
        &self,
        owner_user_id: i64,
        account_id: i64,
    ) -> Result<Option<SubscriptionTask>> {
        sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            SELECT {} FROM subscription_tasks
            WHERE owner_user_id = $1 AND account_id = $2 AND status = ANY($3)
            "#,
            TASK_COLUMNS
        ))
        .bind(owner_user_id)
        .bind(account_id)
        .bind(status_strings(&TaskStatus::ACTIVE))
        .fetch_optional(&self.pool)
        .await?
        .map(SubscriptionTask::try_from)
        .transpose()
    }

    async fn find_due_flood_waits(&self, now: DateTime<Utc>) -> Result<Vec<SubscriptionTask>> {
        sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            SELECT {} FROM subscription_tasks
            WHERE status = 'flood_wait' AND flood_wait_until <= $1
            ORDER BY flood_wait_until
            "#,
            TASK_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(SubscriptionTask::try_from)
        .collect()
    }

    async fn find_interrupted(&self) -> Result<Vec<SubscriptionTask>> {
        sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM subscription_tasks WHERE status = 'processing' ORDER BY created_at",
            TASK_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(SubscriptionTask::try_from)
        .collect()
    }

    async fn transition(
        &self,
        task_id: Uuid,
        from: &[TaskStatus],
        change: &StatusChange,
        now: DateTime<Utc>,
    ) -> Result<Option<SubscriptionTask>> {
        let mut query_builder: QueryBuilder<Postgres> =
            QueryBuilder::new("UPDATE subscription_tasks SET status = ");
        query_builder.push_bind(change.target().as_str());
        query_builder.push(", updated_at = ");
        query_builder.push_bind(now);

        match change {
            StatusChange::PickedUp { at } => {
                query_builder.push(", flood_wait_until = NULL, started_at = COALESCE(started_at, ");
                query_builder.push_bind(*at);
                query_builder.push(")");
            }
            StatusChange::Resumed => {
                query_builder.push(", flood_wait_until = NULL, error_message = NULL");
            }
            StatusChange::FloodWait { until } => {
                query_builder.push(", flood_wait_until = ");
                query_builder.push_bind(*until);
                query_builder.push(", hold_until = ");
                query_builder.push_bind(*until);
            }
            StatusChange::Paused => {
                query_builder.push(", flood_wait_until = NULL");
            }
            StatusChange::Completed { result, at } => {
                query_builder.push(", flood_wait_until = NULL, result = ");
                query_builder.push_bind(result.clone());
                query_builder.push(", completed_at = ");
                query_builder.push_bind(*at);
            }
            StatusChange::Failed { error_message } => {
                query_builder.push(", flood_wait_until = NULL, error_message = ");
                query_builder.push_bind(error_message.clone());
            }
            StatusChange::Cancelled { at } => {
                query_builder.push(", flood_wait_until = NULL, completed_at = ");
                query_builder.push_bind(*at);
            }
        }

        query_builder.push(" WHERE task_id = ");
        query_builder.push_bind(task_id);
        query_builder.push(" AND status = ANY(");
        query_builder.push_bind(status_strings(from));
        query_builder.push(format!(") RETURNING {}", TASK_COLUMNS));

        query_builder
            .build_query_as::<TaskRow>()
            .fetch_optional(&self.pool)
            .await?
            .map(SubscriptionTask::try_from)
            .transpose()
    }

    async fn save_progress(
        &self,
        task_id: Uuid,
        progress: TaskProgress,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE subscription_tasks
            SET current_index = $2,
                successful_count = $3,
                flood_count = $4,
                hold_until = COALESCE($5, hold_until),
                updated_at = $6
            WHERE task_id = $1 AND current_index <= $2
            "#,
        )
        .bind(task_id)
        .bind(progress.current_index)
        .bind(progress.successful_count)
        .bind(progress.flood_count)
        .bind(progress.hold_until)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
