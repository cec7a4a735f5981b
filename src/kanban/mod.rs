//! Kanban State Machine.
//!
//! [`Board`] is the pure in-memory board: tasks by column, optimistic
//! changes in flight, and the moves held behind them. It never touches the
//! network or the store; [`engine::KanbanEngine`] drives it through the
//! Sync Coordinator and turns results into renders and notifications.
//!
//! At most one change per task is in flight. Further changes to that task
//! are held and only validated once the earlier one has settled.

pub mod engine;
pub mod notify;

pub use engine::{BoardEvent, ChangeReport, ChangeStatus, KanbanEngine};
pub use notify::{Notification, NotificationLevel, Notifier};

use std::collections::{BTreeSet, HashMap, VecDeque};

use chrono::Utc;
use serde::Serialize;

use crate::models::{
    Column, CreatePayload, MovePayload, Mutation, Task, TaskId, TaskPatch, TaskStatus, TaskType,
    UpdatePayload,
};

/// Local validation failures. These never reach the network.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KanbanError {
    #[error("Task not on the board: {0}")]
    UnknownTask(TaskId),

    #[error("Task {task_id} is in {actual}, not {claimed}")]
    StaleColumn {
        task_id: TaskId,
        claimed: Column,
        actual: Column,
    },

    #[error("Invalid change: {0}")]
    Invalid(String),
}

/// A change requested on one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BoardOp {
    Move {
        from: Column,
        to: Column,
        index: usize,
    },
    /// Quick action: mark completed
    Complete,
    /// Quick action: set the progress of a calendar task
    Progress { percent: u8 },
}

/// An optimistic change that now needs to reach the server.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedChange {
    pub change_id: u64,
    pub task_id: TaskId,
    pub mutation: Mutation,
    /// Column the task sits in after the change
    pub column: Column,
}

/// Result of applying a [`BoardOp`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeResult {
    /// Status or fields changed; the caller must submit `mutation`
    Applied(AppliedChange),
    /// Same-column move; order only, no network obligation
    Reordered {
        task_id: TaskId,
        column: Column,
        index: usize,
    },
    /// Held behind the change already in flight for this task
    Deferred { task_id: TaskId, queued: usize },
}

/// How the server answered an in-flight change.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    /// Keep the optimistic state, replacing it with the server's record when
    /// one was returned
    Accepted(Option<Task>),
    /// Restore the state from before the change
    Reverted,
}

#[derive(Debug, Clone)]
enum Prior {
    Existing {
        task: Task,
        column: Column,
        index: usize,
        /// Positions of the other tasks in the columns the change touched
        neighbours: Vec<(TaskId, u32)>,
    },
    /// The change created the task; reverting removes it
    Created,
}

#[derive(Debug, Clone)]
struct PendingChange {
    change_id: u64,
    prior: Prior,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnView {
    pub column: Column,
    pub title: &'static str,
    pub tasks: Vec<Task>,
}

/// Serializable render of the board.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoardSnapshot {
    pub columns: Vec<ColumnView>,
    /// Tasks with a change awaiting the server
    pub in_flight: Vec<TaskId>,
}

impl BoardSnapshot {
    pub fn column(&self, column: Column) -> &ColumnView {
        &self.columns[column.index()]
    }

    /// Ids in `column`, top to bottom.
    pub fn ids(&self, column: Column) -> Vec<TaskId> {
        self.column(column).tasks.iter().map(|t| t.id).collect()
    }
}

/// The board.
#[derive(Debug, Clone, Default)]
pub struct Board {
    tasks: HashMap<TaskId, Task>,
    columns: [Vec<TaskId>; 3],
    in_flight: HashMap<TaskId, PendingChange>,
    deferred: HashMap<TaskId, VecDeque<BoardOp>>,
    /// Tasks whose position changed since the last `take_repositioned`
    repositioned: BTreeSet<TaskId>,
    next_change: u64,
}

impl Board {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tasks(tasks: Vec<Task>) -> Self {
        let mut board = Self::new();
        board.load(tasks);
        board
    }

    /// Rebuild the board from a task snapshot.
    ///
    /// Tasks with a change in flight keep their optimistic local version.
    /// Deleted tasks are not shown. Columns are ordered by position, then id.
    pub fn load(&mut self, tasks: Vec<Task>) {
        let overlays: Vec<Task> = self
            .in_flight
            .keys()
            .filter_map(|id| self.tasks.get(id).cloned())
            .collect();

        let mut incoming: Vec<Task> = tasks
            .into_iter()
            .filter(|t| t.is_on_board() && !self.in_flight.contains_key(&t.id))
            .collect();
        incoming.extend(overlays);
        incoming.sort_by_key(|t| (t.position, t.id));

        self.tasks.clear();
        self.columns = Default::default();
        for task in incoming {
            self.columns[task.column().index()].push(task.id);
            self.tasks.insert(task.id, task);
        }
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Column and index of a task.
    pub fn placement(&self, id: TaskId) -> Option<(Column, usize)> {
        Column::ALL.into_iter().find_map(|column| {
            self.columns[column.index()]
                .iter()
                .position(|t| *t == id)
                .map(|index| (column, index))
        })
    }

    pub fn tasks_in(&self, column: Column) -> Vec<&Task> {
        self.columns[column.index()]
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .collect()
    }

    pub fn is_in_flight(&self, id: TaskId) -> bool {
        self.in_flight.contains_key(&id)
    }

    /// Tasks whose position changed since the last call, so they can be
    /// written back to the store.
    pub fn take_repositioned(&mut self) -> Vec<TaskId> {
        std::mem::take(&mut self.repositioned).into_iter().collect()
    }

    /// Smallest temporary id not used on the board.
    pub fn next_temp_id(&self) -> TaskId {
        self.tasks.keys().copied().min().unwrap_or(0).min(0) - 1
    }

    pub fn snapshot(&self) -> BoardSnapshot {
        let columns = Column::ALL
            .into_iter()
            .map(|column| ColumnView {
                column,
                title: column.title(),
                tasks: self.tasks_in(column).into_iter().cloned().collect(),
            })
            .collect();
        let mut in_flight: Vec<TaskId> = self.in_flight.keys().copied().collect();
        in_flight.sort_unstable();
        BoardSnapshot { columns, in_flight }
    }

    // === Changes ===

    /// Move a task. `from` must be the column the task is in right now.
    pub fn apply_move(
        &mut self,
        task_id: TaskId,
        from: Column,
        to: Column,
        index: usize,
    ) -> Result<ChangeResult, KanbanError> {
        self.apply(task_id, BoardOp::Move { from, to, index })
    }

    /// Apply a change optimistically, or hold it if the task is busy.
    pub fn apply(&mut self, task_id: TaskId, op: BoardOp) -> Result<ChangeResult, KanbanError> {
        let Some(task) = self.tasks.get(&task_id) else {
            return Err(KanbanError::UnknownTask(task_id));
        };
        let task_type = task.task_type;
        let status = task.status.clone();

        if self.in_flight.contains_key(&task_id) {
            let queue = self.deferred.entry(task_id).or_default();
            queue.push_back(op);
            return Ok(ChangeResult::Deferred {
                task_id,
                queued: queue.len(),
            });
        }

        let (column, index) = self
            .placement(task_id)
            .ok_or(KanbanError::UnknownTask(task_id))?;

        match op {
            BoardOp::Move { from, to, index: target } => {
                if from != column {
                    return Err(KanbanError::StaleColumn {
                        task_id,
                        claimed: from,
                        actual: column,
                    });
                }
                if from == to {
                    let new_index = self.relocate(task_id, to, target);
                    return Ok(ChangeResult::Reordered {
                        task_id,
                        column: to,
                        index: new_index,
                    });
                }

                let prior = self.prior(task_id, column, index, &[from, to]);
                let new_status = to.status_on_entry(task_type);
                let position = self.relocate(task_id, to, target);
                self.update(task_id, |task| task.status = new_status.clone());

                let mutation = Mutation::MoveTask(MovePayload {
                    task_id,
                    task_type,
                    from_column: from,
                    to_column: to,
                    new_status,
                    position,
                });
                Ok(ChangeResult::Applied(self.begin(task_id, prior, mutation, to)))
            }
            BoardOp::Complete => {
                if status == TaskStatus::Completed {
                    return Err(KanbanError::Invalid(format!(
                        "task {} is already completed",
                        task_id
                    )));
                }
                let prior = self.prior(task_id, column, index, &[column, Column::Done]);
                if column != Column::Done {
                    let end = self.columns[Column::Done.index()].len();
                    self.relocate(task_id, Column::Done, end);
                }
                self.update(task_id, |task| task.status = TaskStatus::Completed);

                let mutation = Mutation::UpdateTask(UpdatePayload {
                    task_id,
                    changes: TaskPatch {
                        status: Some(TaskStatus::Completed),
                        ..TaskPatch::default()
                    },
                });
                Ok(ChangeResult::Applied(self.begin(task_id, prior, mutation, Column::Done)))
            }
            BoardOp::Progress { percent } => {
                if task_type != TaskType::Calendar {
                    return Err(KanbanError::Invalid(format!(
                        "progress is only tracked for calendar tasks (task {})",
                        task_id
                    )));
                }
                if percent > 100 {
                    return Err(KanbanError::Invalid(format!(
                        "progress must be 0-100, got {}",
                        percent
                    )));
                }
                let prior = self.prior(task_id, column, index, &[]);
                self.update(task_id, |task| task.progress = Some(percent));

                let mutation = Mutation::UpdateTask(UpdatePayload {
                    task_id,
                    changes: TaskPatch {
                        progress: Some(percent),
                        ..TaskPatch::default()
                    },
                });
                Ok(ChangeResult::Applied(self.begin(task_id, prior, mutation, column)))
            }
        }
    }

    /// Add a locally created task at the bottom of its column.
    pub fn insert_local(&mut self, payload: CreatePayload) -> Result<AppliedChange, KanbanError> {
        let mut task = payload.to_task();
        task.validate().map_err(KanbanError::Invalid)?;
        if self.tasks.contains_key(&task.id) {
            return Err(KanbanError::Invalid(format!("task id {} is already in use", task.id)));
        }

        let id = task.id;
        let column = task.column();
        task.position = self
            .tasks_in(column)
            .iter()
            .map(|t| t.position + 1)
            .max()
            .unwrap_or(0);
        self.columns[column.index()].push(id);
        self.tasks.insert(id, task);
        Ok(self.begin(id, Prior::Created, Mutation::CreateTask(payload), column))
    }

    /// Settle the in-flight change of a task. Returns the id the task is
    /// known by afterwards, which differs from `task_id` when the server
    /// confirmed a locally created task.
    pub fn settle(&mut self, task_id: TaskId, settlement: Settlement) -> TaskId {
        let Some(pending) = self.in_flight.remove(&task_id) else {
            return task_id;
        };

        match settlement {
            Settlement::Accepted(None) => task_id,
            Settlement::Accepted(Some(server)) => {
                let id = server.id;
                if id != task_id {
                    self.rekey(task_id, id);
                }
                self.replace(server);
                id
            }
            Settlement::Reverted => {
                self.restore(task_id, pending.prior);
                task_id
            }
        }
    }

    /// Next held change for a task, once nothing is in flight for it.
    pub fn take_deferred(&mut self, task_id: TaskId) -> Option<BoardOp> {
        if self.in_flight.contains_key(&task_id) {
            return None;
        }
        let queue = self.deferred.get_mut(&task_id)?;
        let op = queue.pop_front();
        if queue.is_empty() {
            self.deferred.remove(&task_id);
        }
        op
    }

    /// Move everything known about `old` to `new`.
    pub fn rekey(&mut self, old: TaskId, new: TaskId) {
        if let Some(mut task) = self.tasks.remove(&old) {
            task.id = new;
            self.tasks.insert(new, task);
        }
        for column in &mut self.columns {
            for id in column.iter_mut() {
                if *id == old {
                    *id = new;
                }
            }
        }
        if let Some(pending) = self.in_flight.remove(&old) {
            self.in_flight.insert(new, pending);
        }
        if let Some(queue) = self.deferred.remove(&old) {
            self.deferred.insert(new, queue);
        }
    }

    // === Internals ===

    fn prior(&self, task_id: TaskId, column: Column, index: usize, touched: &[Column]) -> Prior {
        let Some(task) = self.tasks.get(&task_id) else {
            return Prior::Created;
        };
        let neighbours = touched
            .iter()
            .flat_map(|c| self.columns[c.index()].iter())
            .filter(|id| **id != task_id)
            .filter_map(|id| self.tasks.get(id).map(|t| (t.id, t.position)))
            .collect();
        Prior::Existing {
            task: task.clone(),
            column,
            index,
            neighbours,
        }
    }

    fn begin(&mut self, task_id: TaskId, prior: Prior, mutation: Mutation, column: Column) -> AppliedChange {
        self.next_change += 1;
        let change_id = self.next_change;
        self.in_flight.insert(task_id, PendingChange { change_id, prior });
        AppliedChange {
            change_id,
            task_id,
            mutation,
            column,
        }
    }

    fn update(&mut self, task_id: TaskId, f: impl FnOnce(&mut Task)) {
        if let Some(task) = self.tasks.get_mut(&task_id) {
            f(task);
            task.updated_at = Utc::now();
        }
    }

    /// Put a task into `column` at `index` (clamped). Returns the final index.
    fn place(&mut self, task_id: TaskId, column: Column, index: usize) -> usize {
        self.detach(task_id);
        let list = &mut self.columns[column.index()];
        let index = index.min(list.len());
        list.insert(index, task_id);
        index
    }

    /// Place a task and renumber the columns it left and entered, so stored
    /// positions follow the order shown.
    fn relocate(&mut self, task_id: TaskId, column: Column, index: usize) -> usize {
        let left = self.placement(task_id).map(|(c, _)| c);
        let index = self.place(task_id, column, index);
        if let Some(left) = left.filter(|c| *c != column) {
            self.renumber(left);
        }
        self.renumber(column);
        index
    }

    fn renumber(&mut self, column: Column) {
        for (index, id) in self.columns[column.index()].iter().enumerate() {
            if let Some(task) = self.tasks.get_mut(id) {
                if task.position != index as u32 {
                    task.position = index as u32;
                    self.repositioned.insert(*id);
                }
            }
        }
    }

    fn detach(&mut self, task_id: TaskId) {
        for column in &mut self.columns {
            column.retain(|id| *id != task_id);
        }
    }

    fn restore(&mut self, task_id: TaskId, prior: Prior) {
        match prior {
            Prior::Created => {
                self.detach(task_id);
                self.tasks.remove(&task_id);
            }
            Prior::Existing {
                task,
                column,
                index,
                neighbours,
            } => {
                self.place(task_id, column, index);
                self.tasks.insert(task_id, task);
                for (id, position) in neighbours {
                    if let Some(task) = self.tasks.get_mut(&id) {
                        if task.position != position {
                            task.position = position;
                            self.repositioned.insert(id);
                        }
                    }
                }
            }
        }
    }

    /// Swap in an authoritative record, relocating it if its column changed.
    fn replace(&mut self, task: Task) {
        if !task.is_on_board() {
            self.detach(task.id);
            self.tasks.remove(&task.id);
            return;
        }
        let column = task.column();
        match self.placement(task.id) {
            Some((current, _)) if current == column => {}
            _ => {
                let end = self.columns[column.index()].len();
                self.place(task.id, column, end);
            }
        }
        self.tasks.insert(task.id, task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Priority;

    fn task(id: TaskId, status: TaskStatus, task_type: TaskType) -> Task {
        let mut task = Task::new(id, format!("Task {}", id));
        task.status = status;
        task.task_type = task_type;
        task.position = id as u32;
        task
    }

    fn board() -> Board {
        Board::from_tasks(vec![
            task(1, TaskStatus::New, TaskType::Regular),
            task(2, TaskStatus::Assigned, TaskType::Calendar),
            task(3, TaskStatus::InProgress, TaskType::Regular),
            task(4, TaskStatus::Waiting, TaskType::Calendar),
            task(5, TaskStatus::Completed, TaskType::Regular),
        ])
    }

    fn applied(result: Result<ChangeResult, KanbanError>) -> AppliedChange {
        match result {
            Ok(ChangeResult::Applied(change)) => change,
            other => panic!("expected Applied, got {:?}", other),
        }
    }

    #[test]
    fn test_load_groups_by_status() {
        let board = board();
        let snapshot = board.snapshot();
        assert_eq!(snapshot.ids(Column::Todo), vec![1, 2]);
        assert_eq!(snapshot.ids(Column::InProgress), vec![3, 4]);
        assert_eq!(snapshot.ids(Column::Done), vec![5]);
    }

    #[test]
    fn test_move_applies_status_immediately() {
        let mut board = board();
        let change = applied(board.apply_move(1, Column::Todo, Column::InProgress, 0));

        assert_eq!(board.task(1).unwrap().status, TaskStatus::InProgress);
        assert_eq!(board.placement(1), Some((Column::InProgress, 0)));
        assert!(board.is_in_flight(1));
        match change.mutation {
            Mutation::MoveTask(payload) => {
                assert_eq!(payload.from_column, Column::Todo);
                assert_eq!(payload.to_column, Column::InProgress);
                assert_eq!(payload.new_status, TaskStatus::InProgress);
                assert_eq!(payload.position, 0);
            }
            other => panic!("unexpected mutation {:?}", other),
        }
    }

    #[test]
    fn test_every_destination_and_type_yields_documented_status() {
        let cases = [
            (Column::Todo, TaskType::Regular, TaskStatus::New),
            (Column::Todo, TaskType::Calendar, TaskStatus::Assigned),
            (Column::InProgress, TaskType::Regular, TaskStatus::InProgress),
            (Column::InProgress, TaskType::Calendar, TaskStatus::InProgress),
            (Column::Done, TaskType::Regular, TaskStatus::Completed),
            (Column::Done, TaskType::Calendar, TaskStatus::Completed),
        ];
        for (to, task_type, expected) in cases {
            let start = if to == Column::Done {
                TaskStatus::New
            } else {
                TaskStatus::Completed
            };
            let mut board = Board::from_tasks(vec![task(7, start.clone(), task_type)]);
            let from = Column::for_status(&start);
            applied(board.apply_move(7, from, to, 0));
            assert_eq!(board.task(7).unwrap().status, expected, "{:?} {:?}", to, task_type);
        }
    }

    #[test]
    fn test_revert_restores_task_exactly() {
        let mut board = board();
        let before = board.task(1).unwrap().clone();
        let placement = board.placement(1);

        applied(board.apply_move(1, Column::Todo, Column::Done, 1));
        board.settle(1, Settlement::Reverted);

        assert_eq!(board.task(1), Some(&before));
        assert_eq!(board.placement(1), placement);
        assert!(!board.is_in_flight(1));
        assert_eq!(board.snapshot().ids(Column::Done), vec![5]);

        // Neighbours shifted by the move are back where they were.
        assert_eq!(board.task(2).unwrap().position, 2);
        assert_eq!(board.task(5).unwrap().position, 5);
        assert_eq!(board.take_repositioned(), vec![2, 5]);
    }

    #[test]
    fn test_reorder_renumbers_column_and_survives_reload() {
        let todo = |id: TaskId, position: u32| {
            let mut t = task(id, TaskStatus::New, TaskType::Regular);
            t.position = position;
            t
        };
        let mut board = Board::from_tasks(vec![todo(1, 0), todo(2, 1), todo(3, 2)]);

        board.apply_move(3, Column::Todo, Column::Todo, 0).unwrap();
        assert_eq!(board.snapshot().ids(Column::Todo), vec![3, 1, 2]);
        assert_eq!(board.take_repositioned(), vec![1, 2, 3]);
        assert!(board.take_repositioned().is_empty());

        let stored: Vec<Task> = board.tasks_in(Column::Todo).into_iter().cloned().collect();
        let reloaded = Board::from_tasks(stored);
        assert_eq!(reloaded.snapshot().ids(Column::Todo), vec![3, 1, 2]);
    }

    #[test]
    fn test_move_renumbers_both_columns() {
        let mut board = board();
        let change = applied(board.apply_move(1, Column::Todo, Column::InProgress, 1));

        let positions = |board: &Board, column: Column| -> Vec<u32> {
            board.tasks_in(column).iter().map(|t| t.position).collect()
        };
        assert_eq!(board.snapshot().ids(Column::InProgress), vec![3, 1, 4]);
        assert_eq!(positions(&board, Column::InProgress), vec![0, 1, 2]);
        assert_eq!(positions(&board, Column::Todo), vec![0]);
        assert!(matches!(change.mutation, Mutation::MoveTask(ref p) if p.position == 1));
    }

    #[test]
    fn test_same_column_move_only_reorders() {
        let mut board = board();
        let result = board.apply_move(1, Column::Todo, Column::Todo, 5).unwrap();

        assert_eq!(
            result,
            ChangeResult::Reordered {
                task_id: 1,
                column: Column::Todo,
                index: 1
            }
        );
        assert_eq!(board.task(1).unwrap().status, TaskStatus::New);
        assert!(!board.is_in_flight(1));
        assert_eq!(board.snapshot().ids(Column::Todo), vec![2, 1]);
    }

    #[test]
    fn test_unknown_task_and_stale_column_are_rejected() {
        let mut board = board();
        assert_eq!(
            board.apply_move(99, Column::Todo, Column::Done, 0),
            Err(KanbanError::UnknownTask(99))
        );
        assert_eq!(
            board.apply_move(3, Column::Todo, Column::Done, 0),
            Err(KanbanError::StaleColumn {
                task_id: 3,
                claimed: Column::Todo,
                actual: Column::InProgress
            })
        );
        assert!(board.snapshot().in_flight.is_empty());
    }

    #[test]
    fn test_second_move_is_held_until_first_settles() {
        let mut board = board();
        applied(board.apply_move(1, Column::Todo, Column::InProgress, 0));

        let held = board.apply_move(1, Column::InProgress, Column::Done, 0).unwrap();
        assert_eq!(held, ChangeResult::Deferred { task_id: 1, queued: 1 });
        // Not applied yet
        assert_eq!(board.task(1).unwrap().status, TaskStatus::InProgress);
        assert_eq!(board.take_deferred(1), None);

        board.settle(1, Settlement::Accepted(None));
        let op = board.take_deferred(1).unwrap();
        applied(board.apply(1, op));
        assert_eq!(board.task(1).unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn test_held_move_is_validated_against_reverted_board() {
        let mut board = board();
        applied(board.apply_move(1, Column::Todo, Column::InProgress, 0));
        board.apply_move(1, Column::InProgress, Column::Done, 0).unwrap();

        board.settle(1, Settlement::Reverted);
        let op = board.take_deferred(1).unwrap();
        assert!(matches!(
            board.apply(1, op),
            Err(KanbanError::StaleColumn { .. })
        ));
    }

    #[test]
    fn test_accepted_with_server_record_replaces_task() {
        let mut board = board();
        applied(board.apply_move(3, Column::InProgress, Column::Done, 0));

        let mut server = task(3, TaskStatus::Completed, TaskType::Regular);
        server.title = "Renamed on server".to_string();
        board.settle(3, Settlement::Accepted(Some(server)));

        assert_eq!(board.task(3).unwrap().title, "Renamed on server");
        assert_eq!(board.placement(3).map(|p| p.0), Some(Column::Done));
    }

    #[test]
    fn test_complete_quick_action() {
        let mut board = board();
        let change = applied(board.apply(3, BoardOp::Complete));
        assert_eq!(change.column, Column::Done);
        assert_eq!(board.snapshot().ids(Column::Done), vec![5, 3]);

        assert!(matches!(
            board.apply(5, BoardOp::Complete),
            Err(KanbanError::Invalid(_))
        ));
    }

    #[test]
    fn test_progress_only_for_calendar_tasks() {
        let mut board = board();
        assert!(board.apply(1, BoardOp::Progress { percent: 50 }).is_err());
        assert!(board.apply(2, BoardOp::Progress { percent: 101 }).is_err());

        applied(board.apply(2, BoardOp::Progress { percent: 40 }));
        assert_eq!(board.task(2).unwrap().progress, Some(40));
        assert_eq!(board.placement(2).map(|p| p.0), Some(Column::Todo));
    }

    #[test]
    fn test_local_create_is_confirmed_under_server_id() {
        let mut board = board();
        let temp_id = board.next_temp_id();
        assert_eq!(temp_id, -1);

        let change = board
            .insert_local(CreatePayload {
                temp_id,
                title: "Drafted offline".to_string(),
                description: None,
                priority: Priority::High,
                task_type: TaskType::Regular,
                due_date: None,
                status: TaskStatus::New,
            })
            .unwrap();
        assert_eq!(change.task_id, -1);
        assert_eq!(board.snapshot().ids(Column::Todo), vec![1, 2, -1]);

        let mut server = task(100, TaskStatus::New, TaskType::Regular);
        server.title = "Drafted offline".to_string();
        assert_eq!(board.settle(-1, Settlement::Accepted(Some(server))), 100);
        assert_eq!(board.snapshot().ids(Column::Todo), vec![1, 2, 100]);
        assert!(board.task(-1).is_none());
    }

    #[test]
    fn test_rejected_create_disappears() {
        let mut board = board();
        board
            .insert_local(CreatePayload {
                temp_id: -1,
                title: "Nope".to_string(),
                description: None,
                priority: Priority::Low,
                task_type: TaskType::Regular,
                due_date: None,
                status: TaskStatus::New,
            })
            .unwrap();
        board.settle(-1, Settlement::Reverted);
        assert!(board.task(-1).is_none());
        assert_eq!(board.len(), 5);
    }

    #[test]
    fn test_load_keeps_in_flight_overlay_and_hides_deleted() {
        let mut board = board();
        applied(board.apply_move(1, Column::Todo, Column::Done, 0));

        let mut gone = task(5, TaskStatus::Deleted, TaskType::Regular);
        gone.title = "gone".to_string();
        board.load(vec![
            task(1, TaskStatus::New, TaskType::Regular),
            task(3, TaskStatus::InProgress, TaskType::Regular),
            gone,
        ]);

        assert_eq!(board.task(1).unwrap().status, TaskStatus::Completed);
        assert!(board.task(5).is_none());
        assert_eq!(board.snapshot().in_flight, vec![1]);
    }
}
