//! Data models for taskdeck entities.
//!
//! This module defines the core data structures:
//! - `Task` - The unit of work shown on the board
//! - `TaskStatus`, `Priority`, `TaskType` - Enumerated task fields
//! - `Column` - Kanban columns and the status <-> column mapping
//! - [`action`] - Queued mutations, permanent failures and sync metadata

pub mod action;

pub use action::{
    CreatePayload, FailedAction, MovePayload, Mutation, OfflineAction, SyncMetadata, TaskPatch,
    UpdatePayload,
};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Task identifier.
///
/// Server-issued ids are positive. Tasks created while offline carry a
/// temporary negative id until the server confirms them.
pub type TaskId = i64;

/// Task status as reported by the server.
///
/// Unknown statuses are preserved verbatim in `Other` so a round trip through
/// the local store never loses information.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskStatus {
    #[default]
    New,
    Assigned,
    InProgress,
    Waiting,
    Completed,
    Cancelled,
    /// Soft-deleted; hidden from the board and dropped on the next full sync
    Deleted,
    Other(String),
}

impl TaskStatus {
    /// Get the wire representation.
    pub fn as_str(&self) -> &str {
        match self {
            TaskStatus::New => "new",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Deleted => "deleted",
            TaskStatus::Other(s) => s.as_str(),
        }
    }
}

impl From<String> for TaskStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "new" => TaskStatus::New,
            "assigned" => TaskStatus::Assigned,
            "in_progress" => TaskStatus::InProgress,
            "waiting" => TaskStatus::Waiting,
            "completed" => TaskStatus::Completed,
            "cancelled" => TaskStatus::Cancelled,
            "deleted" => TaskStatus::Deleted,
            _ => TaskStatus::Other(s),
        }
    }
}

impl From<TaskStatus> for String {
    fn from(status: TaskStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Task priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Parse from string, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "high" => Some(Priority::High),
            "medium" => Some(Priority::Medium),
            "low" => Some(Priority::Low),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

/// Kind of task. Calendar tasks come from scheduled events and track progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    #[default]
    Regular,
    Calendar,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Regular => "regular",
            TaskType::Calendar => "calendar",
        }
    }
}

/// A Kanban column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Column {
    Todo,
    InProgress,
    Done,
}

impl Column {
    /// All columns in board order.
    pub const ALL: [Column; 3] = [Column::Todo, Column::InProgress, Column::Done];

    /// Column a task with the given status belongs to.
    ///
    /// Statuses without a mapping land in the first column.
    pub fn for_status(status: &TaskStatus) -> Column {
        match status {
            TaskStatus::New | TaskStatus::Assigned => Column::Todo,
            TaskStatus::InProgress | TaskStatus::Waiting => Column::InProgress,
            TaskStatus::Completed => Column::Done,
            _ => Column::Todo,
        }
    }

    /// Status a task receives when it is dropped into this column.
    pub fn status_on_entry(self, task_type: TaskType) -> TaskStatus {
        match (self, task_type) {
            (Column::Todo, TaskType::Regular) => TaskStatus::New,
            (Column::Todo, TaskType::Calendar) => TaskStatus::Assigned,
            (Column::InProgress, _) => TaskStatus::InProgress,
            (Column::Done, _) => TaskStatus::Completed,
        }
    }

    /// Position of the column on the board (0-based).
    pub fn index(self) -> usize {
        match self {
            Column::Todo => 0,
            Column::InProgress => 1,
            Column::Done => 2,
        }
    }

    /// Parse from string. Accepts wire names and a few common aliases.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "todo" | "to_do" => Some(Column::Todo),
            "in_progress" | "doing" => Some(Column::InProgress),
            "done" => Some(Column::Done),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Column::Todo => "todo",
            Column::InProgress => "in_progress",
            Column::Done => "done",
        }
    }

    /// Display title used in notifications and human output.
    pub fn title(&self) -> &'static str {
        match self {
            Column::Todo => "To Do",
            Column::InProgress => "In Progress",
            Column::Done => "Done",
        }
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A task tracked on the board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Server id, or a negative temporary id for offline-created tasks
    pub id: TaskId,

    pub title: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub status: TaskStatus,

    #[serde(default)]
    pub priority: Priority,

    #[serde(rename = "type", default)]
    pub task_type: TaskType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,

    /// Completion percentage (0-100), calendar tasks only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,

    /// Ordering hint within the column
    #[serde(default)]
    pub position: u32,

    /// Last-modified timestamp
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new regular task with the given ID and title.
    pub fn new(id: TaskId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            description: None,
            status: TaskStatus::default(),
            priority: Priority::default(),
            task_type: TaskType::default(),
            due_date: None,
            progress: None,
            position: 0,
            updated_at: Utc::now(),
        }
    }

    /// Column this task belongs to, derived from its status.
    pub fn column(&self) -> Column {
        Column::for_status(&self.status)
    }

    /// Whether the task should appear on the board at all.
    pub fn is_on_board(&self) -> bool {
        self.status != TaskStatus::Deleted
    }

    /// Whether this task only exists locally so far.
    pub fn is_temporary(&self) -> bool {
        self.id < 0
    }

    /// Validate field invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.title.trim().is_empty() {
            return Err(format!("task {} has an empty title", self.id));
        }
        if let Some(progress) = self.progress {
            if progress > 100 {
                return Err(format!("progress must be 0-100, got {}", progress));
            }
            if self.task_type != TaskType::Calendar {
                return Err(format!(
                    "progress is only tracked for calendar tasks (task {})",
                    self.id
                ));
            }
        }
        Ok(())
    }

    /// Apply a partial update in place.
    pub fn apply_patch(&mut self, patch: &TaskPatch) {
        if let Some(ref status) = patch.status {
            self.status = status.clone();
        }
        if let Some(progress) = patch.progress {
            self.progress = Some(progress);
        }
        if let Some(ref title) = patch.title {
            self.title = title.clone();
        }
        if let Some(ref description) = patch.description {
            self.description = Some(description.clone());
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(due_date) = patch.due_date {
            self.due_date = Some(due_date);
        }
        self.updated_at = Utc::now();
    }
}
