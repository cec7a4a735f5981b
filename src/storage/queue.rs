//! Offline Action Queue: retry-aware view over the action log.
//!
//! Enqueue is append-only and replay order is insertion order. Each failed
//! delivery bumps the attempt counter; once the counter reaches the policy
//! cap the action is moved to the failed set, where it stays visible until
//! it is retried or discarded.

use tracing::{info, warn};
use uuid::Uuid;

use super::{LocalStore, StorageResult};
use crate::models::{FailedAction, Mutation, OfflineAction};

/// Default retry ceiling for queued actions.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// How many times a queued action is attempted before it is set aside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// What happened to an action after a failed delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueDisposition {
    /// Still queued; will be retried on the next drain
    Retry { attempts: u32 },
    /// Retry budget exhausted; moved to the failed set
    SetAside(FailedAction),
}

/// The Offline Action Queue.
#[derive(Clone)]
pub struct OfflineQueue {
    store: LocalStore,
    policy: RetryPolicy,
}

impl OfflineQueue {
    pub fn new(store: LocalStore, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Append a mutation to the tail of the queue.
    pub async fn enqueue(&self, mutation: &Mutation) -> StorageResult<OfflineAction> {
        self.enqueue_with_ref(mutation, Uuid::new_v4()).await
    }

    /// Append a mutation that already went out once under `client_ref`.
    pub async fn enqueue_with_ref(
        &self,
        mutation: &Mutation,
        client_ref: Uuid,
    ) -> StorageResult<OfflineAction> {
        let action = self.store.enqueue_action(mutation, client_ref).await?;
        info!(
            action_id = action.id,
            action_type = mutation.action_type(),
            task_id = mutation.task_id(),
            "queued offline action"
        );
        Ok(action)
    }

    /// Queued actions in replay order.
    pub async fn pending(&self) -> StorageResult<Vec<OfflineAction>> {
        self.store.list_actions().await
    }

    pub async fn len(&self) -> StorageResult<usize> {
        self.store.count_actions().await
    }

    pub async fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Drop an action the server confirmed.
    pub async fn acknowledge(&self, action: &OfflineAction) -> StorageResult<()> {
        self.store.remove_action(action.id).await?;
        Ok(())
    }

    /// Count a failed delivery and set the action aside once the cap is hit.
    pub async fn record_failure(
        &self,
        action: &OfflineAction,
        error: &str,
    ) -> StorageResult<QueueDisposition> {
        let attempts = self.store.record_attempt(action.id, error).await?;
        if attempts >= self.policy.max_attempts {
            let reason = format!("gave up after {} attempts: {}", attempts, error);
            warn!(action_id = action.id, %reason, "offline action permanently failed");
            let failed = self.store.mark_failed(action.id, &reason).await?;
            return Ok(QueueDisposition::SetAside(failed));
        }
        Ok(QueueDisposition::Retry { attempts })
    }

    /// Set an action aside because the server refused it.
    pub async fn reject(&self, action: &OfflineAction, reason: &str) -> StorageResult<FailedAction> {
        warn!(action_id = action.id, reason, "server rejected replayed action");
        self.store
            .mark_failed(action.id, &format!("rejected by server: {}", reason))
            .await
    }

    /// Permanently failed actions awaiting a decision.
    pub async fn failed(&self) -> StorageResult<Vec<FailedAction>> {
        self.store.list_failed().await
    }

    /// Give a failed action a fresh attempt budget at the tail of the queue.
    pub async fn retry_failed(&self, id: i64) -> StorageResult<OfflineAction> {
        let action = self.store.requeue_failed(id).await?;
        info!(old_id = id, new_id = action.id, "requeued failed action");
        Ok(action)
    }

    /// Drop a failed action for good.
    pub async fn discard_failed(&self, id: i64) -> StorageResult<bool> {
        let removed = self.store.discard_failed(id).await?;
        if removed {
            info!(action_id = id, "discarded failed action");
        }
        Ok(removed)
    }
}
