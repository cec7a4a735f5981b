//! Async handle over the Local Store.
//!
//! Every operation suspends on the store lock, so callers on the application
//! context never block the render path on a write.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Storage, StorageResult};
use crate::models::{FailedAction, Mutation, OfflineAction, SyncMetadata, Task, TaskId};

/// Shared, cloneable handle to a [`Storage`].
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<Mutex<Storage>>,
}

impl LocalStore {
    pub fn new(storage: Storage) -> Self {
        Self {
            inner: Arc::new(Mutex::new(storage)),
        }
    }

    /// In-memory store, mostly for tests and dry runs.
    pub fn in_memory() -> StorageResult<Self> {
        Ok(Self::new(Storage::open_in_memory()?))
    }

    pub async fn put_tasks(&self, tasks: &[Task]) -> StorageResult<()> {
        self.inner.lock().await.put_tasks(tasks)
    }

    pub async fn get_all_tasks(&self) -> StorageResult<Vec<Task>> {
        self.inner.lock().await.get_all_tasks()
    }

    pub async fn get_task(&self, id: TaskId) -> StorageResult<Option<Task>> {
        self.inner.lock().await.get_task(id)
    }

    pub async fn upsert_task(&self, task: &Task) -> StorageResult<()> {
        self.inner.lock().await.upsert_task(task)
    }

    pub async fn remove_local_task(&self, id: TaskId) -> StorageResult<bool> {
        self.inner.lock().await.remove_local_task(id)
    }

    pub async fn confirm_task(&self, temp_id: TaskId, task: &Task) -> StorageResult<()> {
        self.inner.lock().await.confirm_task(temp_id, task)
    }

    pub async fn resolve_alias(&self, id: TaskId) -> StorageResult<TaskId> {
        self.inner.lock().await.resolve_alias(id)
    }

    pub async fn next_temp_id(&self) -> StorageResult<TaskId> {
        self.inner.lock().await.next_temp_id()
    }

    /// Append a mutation under the given idempotency key.
    pub async fn enqueue_action(
        &self,
        mutation: &Mutation,
        client_ref: Uuid,
    ) -> StorageResult<OfflineAction> {
        self.inner.lock().await.enqueue_action(mutation, client_ref)
    }

    pub async fn list_actions(&self) -> StorageResult<Vec<OfflineAction>> {
        self.inner.lock().await.list_actions()
    }

    pub async fn count_actions(&self) -> StorageResult<usize> {
        self.inner.lock().await.count_actions()
    }

    pub async fn record_attempt(&self, id: i64, error: &str) -> StorageResult<u32> {
        self.inner.lock().await.record_attempt(id, error)
    }

    pub async fn remove_action(&self, id: i64) -> StorageResult<bool> {
        self.inner.lock().await.remove_action(id)
    }

    pub async fn mark_failed(&self, id: i64, reason: &str) -> StorageResult<FailedAction> {
        self.inner.lock().await.mark_failed(id, reason)
    }

    pub async fn list_failed(&self) -> StorageResult<Vec<FailedAction>> {
        self.inner.lock().await.list_failed()
    }

    pub async fn requeue_failed(&self, id: i64) -> StorageResult<OfflineAction> {
        self.inner.lock().await.requeue_failed(id)
    }

    pub async fn discard_failed(&self, id: i64) -> StorageResult<bool> {
        self.inner.lock().await.discard_failed(id)
    }

    pub async fn set_last_sync(&self, timestamp: DateTime<Utc>) -> StorageResult<()> {
        self.inner.lock().await.set_last_sync(timestamp)
    }

    pub async fn get_last_sync(&self) -> StorageResult<Option<DateTime<Utc>>> {
        self.inner.lock().await.get_last_sync()
    }

    pub async fn sync_metadata(&self) -> StorageResult<SyncMetadata> {
        self.inner.lock().await.sync_metadata()
    }

    pub async fn clear_all(&self) -> StorageResult<()> {
        self.inner.lock().await.clear_all()
    }
}
