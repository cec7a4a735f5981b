//! Mutations, queued offline actions and sync bookkeeping.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Column, Priority, Task, TaskId, TaskStatus, TaskType};

/// Body of a `move_task` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovePayload {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub from_column: Column,
    pub to_column: Column,
    pub new_status: TaskStatus,
    pub position: usize,
}

/// Body of a `create_task` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePayload {
    /// Temporary local id the server response replaces
    pub temp_id: TaskId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub priority: Priority,
    pub task_type: TaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    pub status: TaskStatus,
}

impl CreatePayload {
    /// Build the local placeholder task for this creation.
    pub fn to_task(&self) -> Task {
        let mut task = Task::new(self.temp_id, self.title.clone());
        task.description = self.description.clone();
        task.priority = self.priority;
        task.task_type = self.task_type;
        task.due_date = self.due_date;
        task.status = self.status.clone();
        task
    }
}

/// Partial task update. Only the fields that are set are sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
}

/// Body of an `update_task` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePayload {
    pub task_id: TaskId,
    pub changes: TaskPatch,
}

/// A mutation that must reach the server.
///
/// Serialized with an `action_type` tag and a `payload` body, which is also
/// the layout of the offline action log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action_type", content = "payload", rename_all = "snake_case")]
pub enum Mutation {
    MoveTask(MovePayload),
    CreateTask(CreatePayload),
    UpdateTask(UpdatePayload),
}

impl Mutation {
    /// Action type tag (`move_task`, `create_task`, `update_task`).
    pub fn action_type(&self) -> &'static str {
        match self {
            Mutation::MoveTask(_) => "move_task",
            Mutation::CreateTask(_) => "create_task",
            Mutation::UpdateTask(_) => "update_task",
        }
    }

    /// The task this mutation targets.
    pub fn task_id(&self) -> TaskId {
        match self {
            Mutation::MoveTask(p) => p.task_id,
            Mutation::CreateTask(p) => p.temp_id,
            Mutation::UpdateTask(p) => p.task_id,
        }
    }

    /// Copy of this mutation addressed to another task id.
    ///
    /// Used at replay time when a temporary id has since been confirmed.
    pub fn retarget(&self, id: TaskId) -> Mutation {
        let mut copy = self.clone();
        match copy {
            Mutation::MoveTask(ref mut p) => p.task_id = id,
            Mutation::CreateTask(ref mut p) => p.temp_id = id,
            Mutation::UpdateTask(ref mut p) => p.task_id = id,
        }
        copy
    }

    /// Replay this mutation's intended effect onto a task snapshot.
    ///
    /// Creations append their placeholder task when it is not present yet.
    pub fn apply_to(&self, tasks: &mut Vec<Task>) {
        match self {
            Mutation::MoveTask(p) => {
                if let Some(task) = tasks.iter_mut().find(|t| t.id == p.task_id) {
                    task.status = p.new_status.clone();
                    task.position = p.position as u32;
                    task.updated_at = Utc::now();
                }
            }
            Mutation::CreateTask(p) => {
                if !tasks.iter().any(|t| t.id == p.temp_id) {
                    tasks.push(p.to_task());
                }
            }
            Mutation::UpdateTask(p) => {
                if let Some(task) = tasks.iter_mut().find(|t| t.id == p.task_id) {
                    task.apply_patch(&p.changes);
                }
            }
        }
    }
}

/// A mutation the server has not confirmed yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineAction {
    /// Auto-incrementing id; replay order
    pub id: i64,

    /// Idempotency key sent with every delivery attempt
    pub client_ref: Uuid,

    #[serde(flatten)]
    pub mutation: Mutation,

    /// When the action was enqueued
    pub timestamp: DateTime<Utc>,

    /// Delivery attempts so far
    pub attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// An action set aside after exhausting its retries or being rejected on replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedAction {
    #[serde(flatten)]
    pub action: OfflineAction,

    pub failed_at: DateTime<Utc>,

    pub reason: String,
}

/// Single-row sync bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub last_sync: Option<DateTime<Utc>>,
}

impl SyncMetadata {
    /// Whether a full reload is due.
    pub fn needs_full_reload(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        match self.last_sync {
            None => true,
            Some(last) => now.signed_duration_since(last) >= max_age,
        }
    }
}
