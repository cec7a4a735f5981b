//! The engine that drives the board through the Sync Coordinator.
//!
//! Every change follows the same path: apply optimistically, render,
//! persist the optimistic record, submit, then settle (keep or revert) and
//! render again. Changes held behind an in-flight one are run afterwards,
//! in the order they were requested.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::NaiveDate;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::notify::{Notification, NotificationLevel, Notifier};
use super::{AppliedChange, Board, BoardOp, BoardSnapshot, ChangeResult, KanbanError, Settlement};
use crate::api::TaskApi;
use crate::models::{Column, CreatePayload, Mutation, Priority, Task, TaskId, TaskType};
use crate::storage::StorageError;
use crate::sync::{DrainReport, SubmitOutcome, SyncCoordinator, SyncError, SyncReport};

const EVENT_CAPACITY: usize = 64;

/// What the engine publishes for a renderer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum BoardEvent {
    Rendered(BoardSnapshot),
    Notification(Notification),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    /// Applied and kept (delivered or queued)
    Applied,
    Reordered,
    /// Held behind another change to the same task
    Deferred,
    /// Rejected by the server and rolled back
    Reverted,
}

/// Result of one user change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeReport {
    pub task_id: TaskId,
    pub status: ChangeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SubmitOutcome>,
    /// The task as the board shows it afterwards
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notifications: Vec<Notification>,
}

/// Fields for a task created from the board.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub priority: Priority,
    pub task_type: TaskType,
    pub due_date: Option<NaiveDate>,
}

/// The Kanban engine.
pub struct KanbanEngine<A: TaskApi> {
    board: Mutex<Board>,
    sync: Arc<SyncCoordinator<A>>,
    notifier: Mutex<Notifier>,
    events: broadcast::Sender<BoardEvent>,
}

impl<A: TaskApi> KanbanEngine<A> {
    pub fn new(sync: Arc<SyncCoordinator<A>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            board: Mutex::new(Board::new()),
            sync,
            notifier: Mutex::new(Notifier::new()),
            events,
        }
    }

    /// Build the board from the Local Store.
    pub async fn load(&self) -> Result<BoardSnapshot, StorageError> {
        let tasks = self.sync.store().get_all_tasks().await?;
        self.lock_board().load(tasks);
        Ok(self.render())
    }

    pub fn sync(&self) -> &Arc<SyncCoordinator<A>> {
        &self.sync
    }

    pub fn snapshot(&self) -> BoardSnapshot {
        self.lock_board().snapshot()
    }

    pub fn task(&self, id: TaskId) -> Option<Task> {
        self.lock_board().task(id).cloned()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.lock_notifier().history().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BoardEvent> {
        self.events.subscribe()
    }

    // === Changes ===

    /// Drag a task from `from` to `to`, landing at `index`.
    pub async fn move_task(
        &self,
        task_id: TaskId,
        from: Column,
        to: Column,
        index: usize,
    ) -> Result<ChangeReport, KanbanError> {
        self.run_op(task_id, BoardOp::Move { from, to, index }).await
    }

    /// Move a task to `to` from wherever it is now.
    pub async fn move_to(
        &self,
        task_id: TaskId,
        to: Column,
        index: Option<usize>,
    ) -> Result<ChangeReport, KanbanError> {
        let (from, target) = {
            let board = self.lock_board();
            let (from, _) = board
                .placement(task_id)
                .ok_or(KanbanError::UnknownTask(task_id))?;
            let end = board.tasks_in(to).len();
            (from, index.unwrap_or(end))
        };
        self.move_task(task_id, from, to, target).await
    }

    pub async fn complete_task(&self, task_id: TaskId) -> Result<ChangeReport, KanbanError> {
        self.run_op(task_id, BoardOp::Complete).await
    }

    pub async fn update_progress(
        &self,
        task_id: TaskId,
        percent: u8,
    ) -> Result<ChangeReport, KanbanError> {
        self.run_op(task_id, BoardOp::Progress { percent }).await
    }

    /// Create a task. It gets a temporary negative id until the server
    /// confirms it.
    pub async fn create_task(&self, new: NewTask) -> Result<ChangeReport, KanbanError> {
        let title = new.title.trim().to_string();
        if title.is_empty() {
            return Err(KanbanError::Invalid("title must not be empty".to_string()));
        }

        let from_store = match self.sync.store().next_temp_id().await {
            Ok(id) => id,
            Err(e) => {
                self.storage_warning(&e);
                -1
            }
        };

        let change = {
            let mut board = self.lock_board();
            let temp_id = from_store.min(board.next_temp_id());
            board.insert_local(CreatePayload {
                temp_id,
                title,
                description: new.description,
                priority: new.priority,
                task_type: new.task_type,
                due_date: new.due_date,
                status: Column::Todo.status_on_entry(new.task_type),
            })?
        };

        let report = self.drive(change).await;
        self.run_deferred(report.task_id).await;
        Ok(report)
    }

    async fn run_op(&self, task_id: TaskId, op: BoardOp) -> Result<ChangeReport, KanbanError> {
        let result = self.lock_board().apply(task_id, op);
        let result = match result {
            Ok(result) => result,
            Err(e) => {
                warn!(task_id, error = %e, "change refused locally");
                return Err(e);
            }
        };

        match result {
            ChangeResult::Applied(change) => {
                let report = self.drive(change).await;
                self.run_deferred(report.task_id).await;
                Ok(report)
            }
            ChangeResult::Reordered { task_id, .. } => {
                self.render();
                self.persist_positions().await;
                Ok(self.report(task_id, ChangeStatus::Reordered, None, Vec::new()))
            }
            ChangeResult::Deferred { task_id, queued } => {
                debug!(task_id, queued, "change held behind in-flight change");
                Ok(self.report(task_id, ChangeStatus::Deferred, None, Vec::new()))
            }
        }
    }

    /// Submit an applied change and settle it.
    async fn drive(&self, change: AppliedChange) -> ChangeReport {
        let id = change.task_id;
        let title = self.title_of(id);
        self.render();
        self.persist(id).await;
        self.persist_positions().await;

        let outcome = self.sync.submit(change.mutation.clone()).await;
        let mut notifications = Vec::new();
        let (settlement, status) = match &outcome {
            SubmitOutcome::Accepted { task } => (Settlement::Accepted(task.clone()), ChangeStatus::Applied),
            SubmitOutcome::Queued { .. } => {
                notifications.push(self.notify(
                    NotificationLevel::Info,
                    format!("\"{}\" saved offline, it will sync when you are back online", title),
                    Some(id),
                ));
                (Settlement::Accepted(None), ChangeStatus::Applied)
            }
            SubmitOutcome::Degraded { warning } => {
                notifications.push(self.notify(NotificationLevel::Warning, warning.clone(), Some(id)));
                (Settlement::Accepted(None), ChangeStatus::Applied)
            }
            SubmitOutcome::Rejected { reason } => {
                notifications.push(self.notify(
                    NotificationLevel::Error,
                    rejection_message(&change, &title, reason),
                    Some(id),
                ));
                (Settlement::Reverted, ChangeStatus::Reverted)
            }
        };

        let settled_id = self.lock_board().settle(id, settlement);
        if status == ChangeStatus::Reverted {
            warn!(task_id = id, change_id = change.change_id, "reverted optimistic change");
            self.persist_revert(id, &change.mutation).await;
            self.persist_positions().await;
        }
        self.render();
        self.report(settled_id, status, Some(outcome), notifications)
    }

    /// Run changes that were held for a task, validating each against the
    /// board as it is now.
    async fn run_deferred(&self, task_id: TaskId) {
        loop {
            let Some(op) = self.lock_board().take_deferred(task_id) else {
                break;
            };
            let result = self.lock_board().apply(task_id, op);
            match result {
                Ok(ChangeResult::Applied(change)) => {
                    self.drive(change).await;
                }
                Ok(ChangeResult::Reordered { .. }) => {
                    self.render();
                    self.persist_positions().await;
                }
                Ok(ChangeResult::Deferred { .. }) => break,
                Err(e) => {
                    warn!(task_id, error = %e, "dropping held change");
                    self.notify(
                        NotificationLevel::Warning,
                        format!("A queued change to task {} no longer applies: {}", task_id, e),
                        Some(task_id),
                    );
                }
            }
        }
    }

    // === Sync ===

    /// Drain the offline queue and refresh the board from the store.
    pub async fn drain(&self) -> Result<DrainReport, SyncError> {
        let report = self.sync.drain_queue().await?;
        self.notify_failures(&report);

        if report.needs_full_sync && self.sync.is_online() {
            match self.sync.sync(true).await {
                Ok(resync) => self.notify_failures(&resync.drain),
                Err(e) => warn!(error = %e, "full resync after rejected replay failed"),
            }
        }
        if !report.skipped {
            self.reload().await;
        }
        Ok(report)
    }

    /// Sync with the server (full when due or forced) and refresh the board.
    pub async fn sync_now(&self, force_full: bool) -> Result<SyncReport, SyncError> {
        let report = self.sync.sync(force_full).await?;
        self.notify_failures(&report.drain);
        self.reload().await;
        Ok(report)
    }

    /// Record connectivity; coming back online drains the queue.
    pub async fn set_online(&self, online: bool) {
        if self.sync.set_online(online) && online {
            if let Err(e) = self.drain().await {
                warn!(error = %e, "drain after reconnect failed");
            }
        }
    }

    fn notify_failures(&self, report: &DrainReport) {
        for failed in &report.failed {
            let task_id = failed.action.mutation.task_id();
            self.notify(
                NotificationLevel::Error,
                format!(
                    "Could not sync {} for task {}: {}",
                    failed.action.mutation.action_type(),
                    task_id,
                    failed.reason
                ),
                Some(task_id),
            );
        }
    }

    /// Rebuild the board from the store. When the store cannot be read the
    /// current board stays up and a warning is raised instead.
    pub async fn reload(&self) {
        match self.sync.store().get_all_tasks().await {
            Ok(tasks) => {
                self.lock_board().load(tasks);
                self.render();
            }
            Err(e) => self.storage_warning(&e),
        }
    }

    // === Helpers ===

    fn lock_board(&self) -> MutexGuard<'_, Board> {
        self.board.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_notifier(&self) -> MutexGuard<'_, Notifier> {
        self.notifier.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn render(&self) -> BoardSnapshot {
        let snapshot = self.snapshot();
        let _ = self.events.send(BoardEvent::Rendered(snapshot.clone()));
        snapshot
    }

    fn notify(&self, level: NotificationLevel, message: String, task_id: Option<TaskId>) -> Notification {
        let notification = self.lock_notifier().notify(level, message, task_id);
        let _ = self
            .events
            .send(BoardEvent::Notification(notification.clone()));
        notification
    }

    fn storage_warning(&self, error: &StorageError) {
        warn!(error = %error, "local store unavailable, keeping in-memory board");
        self.notify(
            NotificationLevel::Warning,
            format!("Offline persistence may be degraded: {}", error),
            None,
        );
    }

    fn title_of(&self, id: TaskId) -> String {
        self.lock_board()
            .task(id)
            .map(|t| t.title.clone())
            .unwrap_or_else(|| format!("task {}", id))
    }

    /// Write the board's current version of a task to the store.
    async fn persist(&self, id: TaskId) {
        let Some(task) = self.task(id) else {
            return;
        };
        if let Err(e) = self.sync.store().upsert_task(&task).await {
            self.storage_warning(&e);
        }
    }

    /// Write back every task whose position shifted with the last change.
    async fn persist_positions(&self) {
        let ids = self.lock_board().take_repositioned();
        for id in ids {
            self.persist(id).await;
        }
    }

    async fn persist_revert(&self, id: TaskId, mutation: &Mutation) {
        match mutation {
            Mutation::CreateTask(_) => {
                if let Err(e) = self.sync.store().remove_local_task(id).await {
                    self.storage_warning(&e);
                }
            }
            _ => self.persist(id).await,
        }
    }

    fn report(
        &self,
        task_id: TaskId,
        status: ChangeStatus,
        outcome: Option<SubmitOutcome>,
        notifications: Vec<Notification>,
    ) -> ChangeReport {
        ChangeReport {
            task_id,
            status,
            outcome,
            task: self.task(task_id),
            notifications,
        }
    }
}

fn rejection_message(change: &AppliedChange, title: &str, reason: &str) -> String {
    match &change.mutation {
        Mutation::MoveTask(payload) => format!(
            "Could not move \"{}\" to {}: {}",
            title,
            payload.to_column.title(),
            reason
        ),
        Mutation::CreateTask(_) => format!("Could not create \"{}\": {}", title, reason),
        Mutation::UpdateTask(_) => format!(
            "Could not update \"{}\" in {}: {}",
            title,
            change.column.title(),
            reason
        ),
    }
}
