use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;
use validator::Validate;

use super::chat_groups::ChatGroup;
use super::common::ChatTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    FloodWait,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Statuses that hold the account's single active slot.
    pub const ACTIVE: [TaskStatus; 3] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::FloodWait,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::FloodWait => "flood_wait",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "flood_wait" => Ok(TaskStatus::FloodWait),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// Pacing profile between two join attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalMode {
    #[default]
    Safe,
    Aggressive,
}

impl IntervalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalMode::Safe => "safe",
            IntervalMode::Aggressive => "aggressive",
        }
    }
}

impl FromStr for IntervalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "safe" => Ok(IntervalMode::Safe),
            "aggressive" => Ok(IntervalMode::Aggressive),
            other => Err(format!("unknown interval mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionTask {
    pub task_id: Uuid,
    pub owner_user_id: i64,
    pub account_id: i64,
    pub group_id: Uuid,
    pub interval_mode: IntervalMode,
    pub status: TaskStatus,
    pub chat_targets: Vec<ChatTarget>,
    pub total_chats: i32,
    pub current_index: i32,
    pub successful_count: i32,
    pub flood_count: i32,
    pub flood_wait_until: Option<DateTime<Utc>>,
    /// Deadline of the latest flood-wait penalty. Survives pause, so no
    /// attempt is made for the account before it passes.
    pub hold_until: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl SubscriptionTask {
    /// New pending task with the group's targets snapshotted.
    pub fn from_group(
        group: &ChatGroup,
        account_id: i64,
        interval_mode: IntervalMode,
        now: DateTime<Utc>,
    ) -> Self {
        let chat_targets = group.chat_targets.clone();
        Self {
            task_id: Uuid::new_v4(),
            owner_user_id: group.owner_user_id,
            account_id,
            group_id: group.group_id,
            interval_mode,
            status: TaskStatus::Pending,
            total_chats: chat_targets.len() as i32,
            chat_targets,
            current_index: 0,
            successful_count: 0,
            flood_count: 0,
            flood_wait_until: None,
            hold_until: None,
            result: None,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn progress(&self) -> TaskProgress {
        TaskProgress {
            current_index: self.current_index,
            successful_count: self.successful_count,
            flood_count: self.flood_count,
            hold_until: self.hold_until,
        }
    }

    /// The penalty deadline, if it still lies ahead of `now`.
    pub fn held_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.hold_until.filter(|until| *until > now)
    }

    pub fn remaining(&self) -> i32 {
        (self.total_chats - self.current_index).max(0)
    }

    pub fn progress_percent(&self) -> i32 {
        if self.total_chats == 0 {
            return 100;
        }
        (self.current_index as i64 * 100 / self.total_chats as i64) as i32
    }
}

/// Counters written by the run-loop after every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskProgress {
    pub current_index: i32,
    pub successful_count: i32,
    pub flood_count: i32,
    /// Written when set; a save never clears an earlier hold.
    pub hold_until: Option<DateTime<Utc>>,
}

/// A status transition together with the fields it touches.
///
/// Stores apply a change only while the record is in one of the caller's
/// expected source states; everything not listed here is left as is.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusChange {
    /// Run-loop pickup: `started_at` is set on the first pickup only.
    PickedUp { at: DateTime<Utc> },
    /// Operator resumed a flood-waited or failed task.
    Resumed,
    FloodWait { until: DateTime<Utc> },
    Paused,
    Completed { result: String, at: DateTime<Utc> },
    Failed { error_message: String },
    Cancelled { at: DateTime<Utc> },
}

impl StatusChange {
    pub fn target(&self) -> TaskStatus {
        match self {
            StatusChange::PickedUp { .. } | StatusChange::Resumed => TaskStatus::Processing,
            StatusChange::FloodWait { .. } => TaskStatus::FloodWait,
            StatusChange::Paused => TaskStatus::Pending,
            StatusChange::Completed { .. } => TaskStatus::Completed,
            StatusChange::Failed { .. } => TaskStatus::Failed,
            StatusChange::Cancelled { .. } => TaskStatus::Cancelled,
        }
    }

    pub fn apply(&self, task: &mut SubscriptionTask, now: DateTime<Utc>) {
        task.status = self.target();
        task.flood_wait_until = None;
        task.updated_at = now;
        match self {
            StatusChange::PickedUp { at } => {
                task.started_at.get_or_insert(*at);
            }
            StatusChange::Resumed => task.error_message = None,
            StatusChange::FloodWait { until } => {
                task.flood_wait_until = Some(*until);
                task.hold_until = Some(*until);
            }
            StatusChange::Paused => {}
            StatusChange::Completed { result, at } => {
                task.result = Some(result.clone());
                task.completed_at = Some(*at);
            }
            StatusChange::Failed { error_message } => task.error_message = Some(error_message.clone()),
            StatusChange::Cancelled { at } => task.completed_at = Some(*at),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct StartTaskRequest {
    #[validate(required, range(min = 1))]
    pub account_id: Option<i64>,
    #[validate(required)]
    pub group_id: Option<Uuid>,
    #[serde(default)]
    pub interval_mode: IntervalMode,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListTasksQuery {
    pub status: Option<TaskStatus>,
}

/// Task as returned to pollers, with the schedule-dependent fields derived
/// at read time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    #[serde(flatten)]
    pub task: SubscriptionTask,
    pub progress_percent: i32,
    pub estimated_completion: Option<DateTime<Utc>>,
}
