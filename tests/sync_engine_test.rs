//! Integration tests for the board, the offline queue and the sync
//! coordinator working together against an in-memory server.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{Harness, MockApi, TempDir};
use uuid::Uuid;

use taskdeck::api::{ApiError, AuthInfo, MutationAck, TaskApi};
use taskdeck::kanban::{ChangeStatus, KanbanEngine, KanbanError, NotificationLevel, engine::NewTask};
use taskdeck::models::{Column, Mutation, Task, TaskId, TaskStatus, TaskType};
use taskdeck::storage::{LocalStore, RetryPolicy};
use taskdeck::sync::{SubmitOutcome, SyncConfig, SyncCoordinator, SyncPlan};

fn task(id: TaskId, title: &str) -> Task {
    Task::new(id, title)
}

fn calendar_task(id: TaskId, title: &str) -> Task {
    let mut task = Task::new(id, title);
    task.task_type = TaskType::Calendar;
    task.status = TaskStatus::Assigned;
    task
}

fn move_targets(mutations: &[Mutation]) -> Vec<(TaskId, Column)> {
    mutations
        .iter()
        .filter_map(|m| match m {
            Mutation::MoveTask(p) => Some((p.task_id, p.to_column)),
            _ => None,
        })
        .collect()
}

/// Server that takes a moment to answer, so concurrent callers interleave.
struct SlowApi {
    inner: MockApi,
    delay: Duration,
}

#[async_trait]
impl TaskApi for SlowApi {
    async fn auth_check(&self) -> Result<AuthInfo, ApiError> {
        self.inner.auth_check().await
    }

    async fn fetch_tasks(&self, limit: u32, offset: u32) -> Result<Vec<Task>, ApiError> {
        self.inner.fetch_tasks(limit, offset).await
    }

    async fn send(&self, mutation: &Mutation, key: Uuid) -> Result<MutationAck, ApiError> {
        tokio::time::sleep(self.delay).await;
        self.inner.send(mutation, key).await
    }
}

// === Offline move and reconnect ===

#[tokio::test]
async fn test_offline_move_of_task_42_drains_on_reconnect() {
    let h = Harness::new(
        MockApi::with_tasks(vec![task(42, "Write report")]),
        vec![task(42, "Write report")],
        false,
    )
    .await;

    let report = h
        .engine
        .move_task(42, Column::Todo, Column::InProgress, 0)
        .await
        .unwrap();
    assert_eq!(report.status, ChangeStatus::Applied);
    assert!(matches!(report.outcome, Some(SubmitOutcome::Queued { .. })));
    assert_eq!(report.notifications[0].level, NotificationLevel::Info);

    // Rendered immediately under In Progress.
    assert_eq!(h.engine.snapshot().ids(Column::InProgress), vec![42]);

    // Persisted locally.
    let stored = h.store.get_task(42).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::InProgress);

    // Exactly one queued action with the move payload.
    let pending = h.engine.sync().queue().pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    match &pending[0].mutation {
        Mutation::MoveTask(p) => {
            assert_eq!(p.task_id, 42);
            assert_eq!(p.from_column, Column::Todo);
            assert_eq!(p.to_column, Column::InProgress);
            assert_eq!(p.new_status, TaskStatus::InProgress);
        }
        other => panic!("unexpected mutation: {:?}", other),
    }
    assert!(h.api.received().is_empty());

    // Reconnect.
    h.engine.set_online(true).await;

    assert!(h.engine.sync().queue().is_empty().await.unwrap());
    let server = h.api.task(42).unwrap();
    assert_eq!(server.status, TaskStatus::InProgress);
    let stored = h.store.get_task(42).await.unwrap().unwrap();
    assert_eq!(stored.status, server.status);
    assert_eq!(stored.position, server.position);
    assert_eq!(h.engine.snapshot().ids(Column::InProgress), vec![42]);
}

// === Ordering ===

#[tokio::test]
async fn test_queued_moves_replay_in_enqueue_order() {
    let h = Harness::new(
        MockApi::with_tasks(vec![task(7, "Deploy")]),
        vec![task(7, "Deploy")],
        false,
    )
    .await;

    h.engine
        .move_task(7, Column::Todo, Column::InProgress, 0)
        .await
        .unwrap();
    h.engine
        .move_task(7, Column::InProgress, Column::Done, 0)
        .await
        .unwrap();
    h.engine
        .move_task(7, Column::Done, Column::Todo, 0)
        .await
        .unwrap();
    assert_eq!(h.engine.sync().queue().len().await.unwrap(), 3);

    h.engine.set_online(true).await;

    assert_eq!(
        move_targets(&h.api.applied()),
        vec![(7, Column::InProgress), (7, Column::Done), (7, Column::Todo)]
    );
    assert_eq!(h.api.task(7).unwrap().status, TaskStatus::New);
    assert!(h.engine.sync().queue().is_empty().await.unwrap());
}

#[tokio::test]
async fn test_online_change_waits_behind_queued_changes_for_same_task() {
    let h = Harness::new(
        MockApi::with_tasks(vec![task(3, "Review")]),
        vec![task(3, "Review")],
        false,
    )
    .await;

    h.engine
        .move_task(3, Column::Todo, Column::InProgress, 0)
        .await
        .unwrap();

    // Back online, but the queue has not drained yet.
    h.engine.sync().set_online(true);
    let report = h
        .engine
        .move_task(3, Column::InProgress, Column::Done, 0)
        .await
        .unwrap();
    assert!(matches!(report.outcome, Some(SubmitOutcome::Queued { .. })));
    assert!(h.api.received().is_empty());

    h.engine.drain().await.unwrap();
    assert_eq!(
        move_targets(&h.api.applied()),
        vec![(3, Column::InProgress), (3, Column::Done)]
    );
}

// === Idempotent replay ===

#[tokio::test]
async fn test_replay_after_lost_ack_does_not_apply_twice() {
    let h = Harness::new(
        MockApi::with_tasks(vec![task(9, "Call back")]),
        vec![task(9, "Call back")],
        true,
    )
    .await;

    h.api.drop_next_ack();
    let report = h
        .engine
        .move_task(9, Column::Todo, Column::Done, 0)
        .await
        .unwrap();
    assert!(matches!(report.outcome, Some(SubmitOutcome::Queued { .. })));

    let drained = h.engine.drain().await.unwrap();
    assert_eq!(drained.delivered.len(), 1);

    let received = h.api.received();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].1, received[1].1, "same idempotency key on replay");
    assert_eq!(h.api.applied().len(), 1);
    assert_eq!(h.api.task(9).unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_replay_of_move_already_on_server_is_noop() {
    let h = Harness::new(
        MockApi::with_tasks(vec![task(11, "Invoice")]),
        vec![task(11, "Invoice")],
        false,
    )
    .await;

    h.engine
        .move_task(11, Column::Todo, Column::InProgress, 0)
        .await
        .unwrap();
    let pending = h.engine.sync().queue().pending().await.unwrap();

    // Another device already made the same move.
    h.api.send(&pending[0].mutation, Uuid::new_v4()).await.unwrap();
    assert_eq!(h.api.applied().len(), 1);

    h.engine.set_online(true).await;

    assert_eq!(h.api.applied().len(), 1);
    assert!(h.engine.sync().queue().is_empty().await.unwrap());
    assert_eq!(h.api.task(11).unwrap().status, TaskStatus::InProgress);
}

// === Revert ===

#[tokio::test]
async fn test_rejected_move_restores_task_exactly() {
    let tasks = vec![task(1, "First"), task(2, "Second"), task(3, "Third")];
    let h = Harness::new(MockApi::with_tasks(tasks.clone()), tasks, true).await;
    h.api.reject_all(Some("Task is locked"));

    let before = h.engine.task(2).unwrap();
    let ids_before = h.engine.snapshot().ids(Column::Todo);
    assert_eq!(ids_before, vec![1, 2, 3]);

    let report = h.engine.move_task(2, Column::Todo, Column::Done, 0).await.unwrap();

    assert_eq!(report.status, ChangeStatus::Reverted);
    assert_eq!(h.engine.task(2).unwrap(), before);
    assert_eq!(h.engine.snapshot().ids(Column::Todo), ids_before);
    assert!(h.engine.snapshot().ids(Column::Done).is_empty());

    let stored = h.store.get_task(2).await.unwrap().unwrap();
    assert_eq!(stored.status, before.status);
    assert_eq!(stored.position, before.position);

    let message = &report.notifications[0];
    assert_eq!(message.level, NotificationLevel::Error);
    assert!(message.message.contains("Second"));
    assert!(message.message.contains("Done"));
    assert!(h.engine.sync().queue().is_empty().await.unwrap());
}

// === Column mapping ===

#[tokio::test]
async fn test_every_destination_and_type_gets_documented_status() {
    let cases = [
        (TaskType::Regular, Column::Todo, TaskStatus::New),
        (TaskType::Regular, Column::InProgress, TaskStatus::InProgress),
        (TaskType::Regular, Column::Done, TaskStatus::Completed),
        (TaskType::Calendar, Column::Todo, TaskStatus::Assigned),
        (TaskType::Calendar, Column::InProgress, TaskStatus::InProgress),
        (TaskType::Calendar, Column::Done, TaskStatus::Completed),
    ];

    for (task_type, to, expected) in cases {
        let mut t = match task_type {
            TaskType::Regular => task(5, "Mapped"),
            TaskType::Calendar => calendar_task(5, "Mapped"),
        };
        // Start somewhere other than the destination.
        if to == Column::Todo {
            t.status = TaskStatus::InProgress;
        }
        let from = t.column();

        let h = Harness::new(MockApi::with_tasks(vec![t.clone()]), vec![t], true).await;
        let report = h.engine.move_task(5, from, to, 0).await.unwrap();

        assert_eq!(report.status, ChangeStatus::Applied, "{:?} -> {:?}", task_type, to);
        assert_eq!(h.engine.task(5).unwrap().status, expected, "{:?} -> {:?}", task_type, to);
        match &h.api.applied()[0] {
            Mutation::MoveTask(p) => assert_eq!(p.new_status, expected),
            other => panic!("unexpected mutation: {:?}", other),
        }
    }
}

// === Local validation ===

#[tokio::test]
async fn test_local_validation_never_reaches_network() {
    let h = Harness::new(
        MockApi::with_tasks(vec![task(4, "Plan")]),
        vec![task(4, "Plan")],
        true,
    )
    .await;

    let err = h
        .engine
        .move_task(99, Column::Todo, Column::Done, 0)
        .await
        .unwrap_err();
    assert_eq!(err, KanbanError::UnknownTask(99));

    let err = h
        .engine
        .move_task(4, Column::InProgress, Column::Done, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, KanbanError::StaleColumn { actual: Column::Todo, .. }));

    let err = h.engine.update_progress(4, 50).await.unwrap_err();
    assert!(matches!(err, KanbanError::Invalid(_)));

    assert!(h.api.received().is_empty());
}

// === Durability ===

#[tokio::test]
async fn test_queued_action_survives_restart_and_drains() {
    let dir = TempDir::new().unwrap();
    {
        let h = Harness::with_store(
            MockApi::new(),
            Harness::store_in(dir.path()),
            vec![task(42, "Write report")],
            false,
            SyncConfig::default(),
        )
        .await;
        h.engine
            .move_task(42, Column::Todo, Column::InProgress, 0)
            .await
            .unwrap();
    }

    let store = Harness::store_in(dir.path());
    let pending = store.list_actions().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].mutation.task_id(), 42);

    let h = Harness::with_store(
        MockApi::with_tasks(vec![task(42, "Write report")]),
        store,
        Vec::new(),
        true,
        SyncConfig::default(),
    )
    .await;
    // The optimistic state was persisted too.
    assert_eq!(h.engine.snapshot().ids(Column::InProgress), vec![42]);

    let report = h.engine.drain().await.unwrap();
    assert_eq!(report.delivered.len(), 1);
    assert_eq!(report.remaining, 0);
    assert_eq!(h.api.task(42).unwrap().status, TaskStatus::InProgress);
}

// === Drain exclusion ===

#[tokio::test]
async fn test_concurrent_drains_do_not_overlap() {
    let store = LocalStore::in_memory().unwrap();
    store.put_tasks(&[task(1, "One"), task(2, "Two")]).await.unwrap();
    let api = Arc::new(SlowApi {
        inner: MockApi::with_tasks(vec![task(1, "One"), task(2, "Two")]),
        delay: Duration::from_millis(50),
    });
    let sync = Arc::new(SyncCoordinator::new(
        Arc::clone(&api),
        store,
        SyncConfig::default(),
        false,
    ));
    let engine = KanbanEngine::new(Arc::clone(&sync));
    engine.load().await.unwrap();
    engine.move_task(1, Column::Todo, Column::Done, 0).await.unwrap();
    engine.move_task(2, Column::Todo, Column::Done, 0).await.unwrap();

    sync.set_online(true);
    let (a, b) = tokio::join!(sync.drain_queue(), sync.drain_queue());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(a.skipped != b.skipped, "exactly one drain runs");
    let ran = if a.skipped { b } else { a };
    assert_eq!(ran.delivered.len(), 2);
    assert_eq!(api.inner.received().len(), 2);
}

// === Held changes ===

#[tokio::test]
async fn test_second_move_waits_for_first_to_settle() {
    let store = LocalStore::in_memory().unwrap();
    store.put_tasks(&[task(8, "Ship")]).await.unwrap();
    let api = Arc::new(SlowApi {
        inner: MockApi::with_tasks(vec![task(8, "Ship")]),
        delay: Duration::from_millis(50),
    });
    let sync = Arc::new(SyncCoordinator::new(
        Arc::clone(&api),
        store,
        SyncConfig::default(),
        true,
    ));
    let engine = KanbanEngine::new(sync);
    engine.load().await.unwrap();

    let (first, second) = tokio::join!(
        engine.move_task(8, Column::Todo, Column::InProgress, 0),
        engine.move_task(8, Column::InProgress, Column::Done, 0),
    );

    assert_eq!(first.unwrap().status, ChangeStatus::Applied);
    assert_eq!(second.unwrap().status, ChangeStatus::Deferred);
    assert_eq!(
        move_targets(&api.inner.applied()),
        vec![(8, Column::InProgress), (8, Column::Done)]
    );
    assert_eq!(engine.task(8).unwrap().status, TaskStatus::Completed);
    assert!(engine.snapshot().in_flight.is_empty());
}

// === Retry cap ===

#[tokio::test]
async fn test_action_set_aside_after_retry_cap_and_can_be_retried() {
    let config = SyncConfig {
        retry: RetryPolicy { max_attempts: 2 },
        ..SyncConfig::default()
    };
    let h = Harness::with_store(
        MockApi::with_tasks(vec![task(6, "Flaky"), task(12, "Other")]),
        LocalStore::in_memory().unwrap(),
        vec![task(6, "Flaky"), task(12, "Other")],
        false,
        config,
    )
    .await;
    h.engine
        .move_task(6, Column::Todo, Column::InProgress, 0)
        .await
        .unwrap();
    h.engine
        .move_task(12, Column::Todo, Column::Done, 0)
        .await
        .unwrap();

    let sync = h.engine.sync();
    sync.set_online(true);
    h.api.set_offline(true);

    let first = sync.drain_queue().await.unwrap();
    assert!(first.failed.is_empty());
    assert!(first.stalled_on.is_some());
    assert_eq!(first.remaining, 2);

    // The second failure exhausts the budget of the head action only.
    let second = sync.drain_queue().await.unwrap();
    assert_eq!(second.failed.len(), 1);
    assert_eq!(second.failed[0].action.mutation.task_id(), 6);
    assert!(second.failed[0].reason.contains("gave up after 2 attempts"));

    let failed = sync.queue().failed().await.unwrap();
    assert_eq!(failed.len(), 1);

    h.api.set_offline(false);
    let retried = sync.queue().retry_failed(failed[0].action.id).await.unwrap();
    assert_eq!(retried.attempts, 0);

    let report = h.engine.drain().await.unwrap();
    assert_eq!(report.remaining, 0);
    assert!(sync.queue().failed().await.unwrap().is_empty());
    assert_eq!(h.api.task(6).unwrap().status, TaskStatus::InProgress);
    assert_eq!(h.api.task(12).unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_rejected_replay_is_set_aside_and_triggers_full_sync() {
    let h = Harness::new(
        MockApi::with_tasks(vec![task(21, "Archive")]),
        vec![task(21, "Archive")],
        false,
    )
    .await;
    h.engine
        .move_task(21, Column::Todo, Column::Done, 0)
        .await
        .unwrap();

    h.api.reject_all(Some("Task is locked"));
    h.engine.sync().set_online(true);
    let report = h.engine.drain().await.unwrap();

    assert_eq!(report.failed.len(), 1);
    assert!(report.needs_full_sync);
    // The full resync restored the server's copy.
    assert_eq!(h.engine.task(21).unwrap().status, TaskStatus::New);
    assert!(
        h.engine
            .notifications()
            .iter()
            .any(|n| n.level == NotificationLevel::Error && n.task_id == Some(21))
    );
}

// === Offline creation ===

#[tokio::test]
async fn test_offline_created_task_is_confirmed_and_later_moves_follow() {
    let h = Harness::new(MockApi::new(), Vec::new(), false).await;

    let report = h
        .engine
        .create_task(NewTask {
            title: "Buy milk".to_string(),
            ..NewTask::default()
        })
        .await
        .unwrap();
    assert_eq!(report.task_id, -1);
    assert_eq!(h.engine.snapshot().ids(Column::Todo), vec![-1]);

    h.engine
        .move_task(-1, Column::Todo, Column::InProgress, 0)
        .await
        .unwrap();
    assert_eq!(h.engine.sync().queue().len().await.unwrap(), 2);

    h.engine.set_online(true).await;

    assert!(h.engine.sync().queue().is_empty().await.unwrap());
    assert_eq!(h.store.resolve_alias(-1).await.unwrap(), 1000);
    assert_eq!(h.api.task(1000).unwrap().status, TaskStatus::InProgress);
    assert_eq!(h.engine.snapshot().ids(Column::InProgress), vec![1000]);
    assert!(h.store.get_task(-1).await.unwrap().is_none());
}

#[tokio::test]
async fn test_rejected_creation_disappears() {
    let h = Harness::new(MockApi::new(), Vec::new(), true).await;
    h.api.reject_all(Some("Title not allowed"));

    let report = h
        .engine
        .create_task(NewTask {
            title: "Nope".to_string(),
            ..NewTask::default()
        })
        .await
        .unwrap();

    assert_eq!(report.status, ChangeStatus::Reverted);
    assert!(h.engine.snapshot().ids(Column::Todo).is_empty());
    assert!(h.store.get_all_tasks().await.unwrap().is_empty());
}

// === Full sync ===

#[tokio::test]
async fn test_full_sync_replaces_tasks_and_hides_deleted() {
    let mut gone = task(31, "Gone");
    gone.status = TaskStatus::Deleted;
    let h = Harness::new(
        MockApi::with_tasks(vec![gone, task(32, "Kept")]),
        vec![task(30, "Stale")],
        true,
    )
    .await;

    let report = h.engine.sync_now(false).await.unwrap();

    // Never synced before, so a full reload is due.
    assert_eq!(report.plan, SyncPlan::Full);
    assert_eq!(h.engine.snapshot().ids(Column::Todo), vec![32]);
    assert!(h.store.get_last_sync().await.unwrap().is_some());

    let again = h.engine.sync_now(false).await.unwrap();
    assert_eq!(again.plan, SyncPlan::Incremental);
}

#[tokio::test]
async fn test_sync_while_offline_is_an_error() {
    let h = Harness::new(MockApi::new(), Vec::new(), false).await;
    assert!(h.engine.sync_now(true).await.is_err());
}

// === Ordering and storage trouble ===

#[tokio::test]
async fn test_reorder_is_kept_after_reload_from_store() {
    let mut tasks = vec![task(1, "One"), task(2, "Two"), task(3, "Three")];
    for (index, t) in tasks.iter_mut().enumerate() {
        t.position = index as u32;
    }
    let h = Harness::new(MockApi::with_tasks(tasks.clone()), tasks, false).await;

    let report = h
        .engine
        .move_task(3, Column::Todo, Column::Todo, 0)
        .await
        .unwrap();
    assert_eq!(report.status, ChangeStatus::Reordered);

    h.engine.load().await.unwrap();
    assert_eq!(h.engine.snapshot().ids(Column::Todo), vec![3, 1, 2]);
    let positions: Vec<u32> = h
        .store
        .get_all_tasks()
        .await
        .unwrap()
        .iter()
        .map(|t| t.position)
        .collect();
    assert_eq!(positions, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_reload_keeps_board_when_store_is_unreadable() {
    let dir = TempDir::new().unwrap();
    let h = Harness::with_store(
        MockApi::new(),
        Harness::store_in(dir.path()),
        vec![task(1, "One")],
        false,
        SyncConfig::default(),
    )
    .await;

    rusqlite::Connection::open(dir.path().join("taskdeck.db"))
        .unwrap()
        .execute_batch("DROP TABLE tasks;")
        .unwrap();

    h.engine.reload().await;
    assert_eq!(h.engine.snapshot().ids(Column::Todo), vec![1]);
    assert!(
        h.engine
            .notifications()
            .iter()
            .any(|n| n.level == NotificationLevel::Warning)
    );
}
