//! Sync Coordinator.
//!
//! Single chokepoint deciding whether a mutation goes to the network or to
//! the Offline Action Queue, and the owner of queue draining. Network and
//! server failures stop here: callers only ever see one of the
//! [`SubmitOutcome`] variants.

pub mod connectivity;

pub use connectivity::{ConnectionState, ConnectivityProbe, ProbeOutcome, SyncTrigger};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{ApiError, MutationAck, TaskApi};
use crate::models::{FailedAction, Mutation, OfflineAction, Task, TaskId};
use crate::storage::{LocalStore, OfflineQueue, QueueDisposition, RetryPolicy, StorageError};

const EVENT_CAPACITY: usize = 64;

/// Errors from an explicit sync.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("cannot sync while offline")]
    Offline,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Tunables for the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Tasks fetched per page on a full sync
    pub page_size: u32,
    /// Safety-net drain period
    pub drain_interval: Duration,
    /// Age of `last_sync` after which a full reload is due
    pub full_sync_after: chrono::Duration,
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 200,
            drain_interval: Duration::from_secs(300),
            full_sync_after: chrono::Duration::hours(24),
            retry: RetryPolicy::default(),
        }
    }
}

/// What happened to a submitted mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// The server confirmed the change
    Accepted { task: Option<Task> },
    /// Stored for later delivery; the optimistic state stands
    Queued { action_id: i64 },
    /// The server refused the change; the caller must revert
    Rejected { reason: String },
    /// Neither delivered nor durably queued. The optimistic state stands for
    /// this session only.
    Degraded { warning: String },
}

impl SubmitOutcome {
    pub fn must_revert(&self) -> bool {
        matches!(self, SubmitOutcome::Rejected { .. })
    }
}

/// One action delivered during a drain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Delivered {
    pub action_id: i64,
    pub action_type: &'static str,
    pub task_id: TaskId,
}

/// Result of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DrainReport {
    /// Another drain was already running, or the coordinator is offline
    pub skipped: bool,
    pub delivered: Vec<Delivered>,
    /// Set when the drain stopped at an action that will be retried later
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stalled_on: Option<i64>,
    /// Actions set aside during this pass
    pub failed: Vec<FailedAction>,
    /// A replayed action was rejected, so the local snapshot may show state
    /// the server never accepted
    pub needs_full_sync: bool,
    pub remaining: usize,
}

impl DrainReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPlan {
    /// Drain the queue only
    Incremental,
    /// Drain, then reload every task from the server
    Full,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub plan: SyncPlan,
    pub drain: DrainReport,
    /// Tasks stored by a full reload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<usize>,
}

/// Notifications broadcast by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    ConnectivityChanged { online: bool },
    Queued { action_id: i64, task_id: TaskId },
    Drained(DrainReport),
    Synced(SyncReport),
    StorageDegraded { message: String },
    SyncFailed { message: String },
}

/// Replay still-pending mutations over a fresh server snapshot so queued
/// optimistic state survives a full reload. Deleted tasks are dropped.
pub fn rebase(mut tasks: Vec<Task>, pending: &[Mutation]) -> Vec<Task> {
    tasks.retain(Task::is_on_board);
    for mutation in pending {
        mutation.apply_to(&mut tasks);
    }
    tasks
}

/// Resets the drain flag when a drain ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The Sync Coordinator.
pub struct SyncCoordinator<A: TaskApi> {
    api: Arc<A>,
    store: LocalStore,
    queue: OfflineQueue,
    config: SyncConfig,
    online: watch::Sender<bool>,
    draining: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
}

impl<A: TaskApi> SyncCoordinator<A> {
    pub fn new(api: Arc<A>, store: LocalStore, config: SyncConfig, online: bool) -> Self {
        let queue = OfflineQueue::new(store.clone(), config.retry);
        let (online, _) = watch::channel(online);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            api,
            store,
            queue,
            config,
            online,
            draining: AtomicBool::new(false),
            events,
        }
    }

    pub fn api(&self) -> &Arc<A> {
        &self.api
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Record a connectivity change. Returns whether it was a change.
    pub fn set_online(&self, online: bool) -> bool {
        let previous = self.online.send_replace(online);
        if previous != online {
            info!(online, "connectivity changed");
            let _ = self.events.send(SyncEvent::ConnectivityChanged { online });
        }
        previous != online
    }

    pub fn watch_online(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    // === Submit ===

    /// Deliver a mutation now, or queue it for later.
    pub async fn submit(&self, mutation: Mutation) -> SubmitOutcome {
        let mutation = self.resolve(mutation).await;

        if !self.is_online() {
            return self.enqueue(&mutation, Uuid::new_v4()).await;
        }

        // Later changes to a task must not overtake queued ones.
        match self.has_pending_for(mutation.task_id()).await {
            Ok(true) => {
                debug!(task_id = mutation.task_id(), "earlier changes still queued");
                return self.enqueue(&mutation, Uuid::new_v4()).await;
            }
            Ok(false) => {}
            Err(e) => self.degraded(&e),
        }
        if mutation.task_id() < 0 && !matches!(mutation, Mutation::CreateTask(_)) {
            debug!(task_id = mutation.task_id(), "task not confirmed by the server yet");
            return self.enqueue(&mutation, Uuid::new_v4()).await;
        }

        let client_ref = Uuid::new_v4();
        match self.api.send(&mutation, client_ref).await {
            Ok(ack) => {
                debug!(action_type = mutation.action_type(), task_id = mutation.task_id(), "mutation accepted");
                SubmitOutcome::Accepted {
                    task: self.apply_ack(&mutation, ack).await,
                }
            }
            Err(e) if e.is_transient() => {
                info!(error = %e, task_id = mutation.task_id(), "network unavailable, queueing");
                self.enqueue(&mutation, client_ref).await
            }
            Err(e) => {
                warn!(error = %e, task_id = mutation.task_id(), "mutation rejected");
                SubmitOutcome::Rejected {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn resolve(&self, mutation: Mutation) -> Mutation {
        match self.store.resolve_alias(mutation.task_id()).await {
            Ok(id) if id != mutation.task_id() => mutation.retarget(id),
            Ok(_) => mutation,
            Err(e) => {
                self.degraded(&e);
                mutation
            }
        }
    }

    async fn has_pending_for(&self, task_id: TaskId) -> Result<bool, StorageError> {
        for action in self.queue.pending().await? {
            if self.store.resolve_alias(action.mutation.task_id()).await? == task_id {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn enqueue(&self, mutation: &Mutation, client_ref: Uuid) -> SubmitOutcome {
        match self.queue.enqueue_with_ref(mutation, client_ref).await {
            Ok(action) => {
                let _ = self.events.send(SyncEvent::Queued {
                    action_id: action.id,
                    task_id: mutation.task_id(),
                });
                SubmitOutcome::Queued {
                    action_id: action.id,
                }
            }
            Err(e) => {
                self.degraded(&e);
                SubmitOutcome::Degraded {
                    warning: format!("offline persistence is degraded: {}", e),
                }
            }
        }
    }

    /// Overwrite the local record with the server's authoritative copy.
    async fn apply_ack(&self, mutation: &Mutation, ack: MutationAck) -> Option<Task> {
        let task = ack.task?;
        let stored = match mutation {
            Mutation::CreateTask(payload) => self.store.confirm_task(payload.temp_id, &task).await,
            _ => self.store.upsert_task(&task).await,
        };
        if let Err(e) = stored {
            self.degraded(&e);
        }
        Some(task)
    }

    fn degraded(&self, error: &StorageError) {
        warn!(error = %error, "local store write failed");
        let _ = self.events.send(SyncEvent::StorageDegraded {
            message: error.to_string(),
        });
    }

    // === Drain ===

    /// Replay queued actions in order.
    ///
    /// Only one drain runs at a time; a concurrent call returns a skipped
    /// report immediately.
    pub async fn drain_queue(&self) -> Result<DrainReport, StorageError> {
        if self.draining.swap(true, Ordering::AcqRel) {
            debug!("drain already in progress, ignoring trigger");
            return Ok(DrainReport::skipped());
        }
        let _guard = DrainGuard(&self.draining);

        if !self.is_online() {
            let mut report = DrainReport::skipped();
            report.remaining = self.queue.len().await?;
            return Ok(report);
        }

        let mut report = DrainReport::default();
        for action in self.queue.pending().await? {
            if !self.replay(&action, &mut report).await? {
                report.stalled_on = Some(action.id);
                break;
            }
        }
        report.remaining = self.queue.len().await?;

        if !report.delivered.is_empty() || !report.failed.is_empty() {
            info!(
                delivered = report.delivered.len(),
                failed = report.failed.len(),
                remaining = report.remaining,
                "queue drained"
            );
        }
        let _ = self.events.send(SyncEvent::Drained(report.clone()));
        Ok(report)
    }

    /// Replay one action. Returns false when the drain should stop here.
    async fn replay(&self, action: &OfflineAction, report: &mut DrainReport) -> Result<bool, StorageError> {
        let target = self.store.resolve_alias(action.mutation.task_id()).await?;
        let mutation = if target != action.mutation.task_id() {
            action.mutation.retarget(target)
        } else {
            action.mutation.clone()
        };

        match self.api.send(&mutation, action.client_ref).await {
            Ok(ack) => {
                self.queue.acknowledge(action).await?;
                self.apply_ack(&mutation, ack).await;
                debug!(action_id = action.id, task_id = target, "replayed offline action");
                report.delivered.push(Delivered {
                    action_id: action.id,
                    action_type: mutation.action_type(),
                    task_id: target,
                });
                Ok(true)
            }
            Err(e) if e.is_transient() || matches!(e, ApiError::Unauthorized { .. }) => {
                match self.queue.record_failure(action, &e.to_string()).await? {
                    QueueDisposition::Retry { attempts } => {
                        debug!(action_id = action.id, attempts, error = %e, "replay failed, will retry");
                        Ok(false)
                    }
                    QueueDisposition::SetAside(failed) => {
                        report.failed.push(failed);
                        Ok(true)
                    }
                }
            }
            Err(e) => {
                let failed = self.queue.reject(action, &e.to_string()).await?;
                report.failed.push(failed);
                report.needs_full_sync = true;
                Ok(true)
            }
        }
    }

    // === Sync ===

    /// Drain the queue and, when due, reload every task from the server.
    pub async fn sync(&self, force_full: bool) -> Result<SyncReport, SyncError> {
        if !self.is_online() {
            return Err(SyncError::Offline);
        }

        let metadata = self.store.sync_metadata().await?;
        let due = metadata.needs_full_reload(Utc::now(), self.config.full_sync_after);
        let drain = self.drain_queue().await?;

        let plan = if force_full || due || drain.needs_full_sync {
            SyncPlan::Full
        } else {
            SyncPlan::Incremental
        };

        let tasks = match plan {
            SyncPlan::Incremental => None,
            SyncPlan::Full => Some(self.full_reload().await?),
        };

        let report = SyncReport { plan, drain, tasks };
        let _ = self.events.send(SyncEvent::Synced(report.clone()));
        Ok(report)
    }

    async fn full_reload(&self) -> Result<usize, SyncError> {
        let fetched = self.api.fetch_all_tasks(self.config.page_size).await?;

        let mut pending = Vec::new();
        for action in self.queue.pending().await? {
            let target = self.store.resolve_alias(action.mutation.task_id()).await?;
            pending.push(action.mutation.retarget(target));
        }

        let tasks = rebase(fetched, &pending);
        self.store.put_tasks(&tasks).await?;
        self.store.set_last_sync(Utc::now()).await?;
        info!(tasks = tasks.len(), pending = pending.len(), "full sync complete");
        Ok(tasks.len())
    }

    // === Loop ===

    /// Ask the server whether it is reachable and update connectivity.
    pub async fn probe(&self, probe: &mut ConnectivityProbe) -> ProbeOutcome {
        match self.api.auth_check().await {
            Err(e) if e.is_transient() => {
                debug!(error = %e, "connectivity probe failed");
                probe.record_failure()
            }
            Ok(auth) => {
                if !auth.authenticated {
                    warn!("server reachable but session is not authenticated");
                }
                probe.record_success()
            }
            Err(e) => {
                warn!(error = %e, "server reachable but refused auth check");
                probe.record_success()
            }
        }
    }

    /// React to one trigger.
    pub async fn handle_trigger(&self, trigger: SyncTrigger) {
        debug!(?trigger, "sync trigger");
        match trigger {
            SyncTrigger::Offline => {
                self.set_online(false);
            }
            SyncTrigger::Online => {
                self.set_online(true);
                self.drain_logged().await;
            }
            SyncTrigger::VisibilityRegained => {
                if self.is_online() {
                    self.drain_logged().await;
                }
            }
            SyncTrigger::Manual => {
                if let Err(e) = self.sync(false).await {
                    warn!(error = %e, "manual sync failed");
                    self.sync_failed(e.to_string());
                }
            }
        }
    }

    /// Drain, and reload from the server when a replay was rejected so the
    /// stored snapshot drops the refused optimistic state.
    async fn drain_logged(&self) {
        let drain = match self.drain_queue().await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "queue drain failed");
                self.sync_failed(e.to_string());
                return;
            }
        };
        if !drain.needs_full_sync || !self.is_online() {
            return;
        }

        info!(rejected = drain.failed.len(), "replay rejected, reloading from server");
        match self.full_reload().await {
            Ok(count) => {
                let _ = self.events.send(SyncEvent::Synced(SyncReport {
                    plan: SyncPlan::Full,
                    drain,
                    tasks: Some(count),
                }));
            }
            Err(e) => {
                warn!(error = %e, "resync after rejected replay failed");
                self.sync_failed(e.to_string());
            }
        }
    }

    fn sync_failed(&self, message: String) {
        let _ = self.events.send(SyncEvent::SyncFailed { message });
    }

    /// Run the sync loop until `shutdown` fires: triggers from `triggers`,
    /// a periodic drain, and connectivity probes with backoff.
    pub async fn run(
        &self,
        mut triggers: mpsc::Receiver<SyncTrigger>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut probe = ConnectivityProbe::new(self.is_online());
        let mut drain_timer = tokio::time::interval(self.config.drain_interval);
        drain_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        drain_timer.reset();

        let next_probe = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(next_probe);
        let mut triggers_open = true;

        info!(interval_secs = self.config.drain_interval.as_secs(), "sync loop started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                trigger = triggers.recv(), if triggers_open => match trigger {
                    Some(trigger) => self.handle_trigger(trigger).await,
                    None => triggers_open = false,
                },
                _ = drain_timer.tick() => {
                    if self.is_online() {
                        self.drain_logged().await;
                    }
                }
                _ = &mut next_probe => {
                    let outcome = self.probe(&mut probe).await;
                    if let Some(trigger) = outcome.trigger {
                        self.handle_trigger(trigger).await;
                    }
                    next_probe.as_mut().reset(Instant::now() + outcome.next_probe_in);
                }
            }
        }
        info!("sync loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Column, CreatePayload, MovePayload, Priority, TaskStatus, TaskType};

    fn move_to(task_id: TaskId, to: Column) -> Mutation {
        Mutation::MoveTask(MovePayload {
            task_id,
            task_type: TaskType::Regular,
            from_column: Column::Todo,
            to_column: to,
            new_status: to.status_on_entry(TaskType::Regular),
            position: 0,
        })
    }

    #[test]
    fn test_rebase_keeps_pending_moves_over_server_state() {
        let server = vec![Task::new(1, "One"), Task::new(2, "Two")];
        let tasks = rebase(server, &[move_to(2, Column::Done)]);

        assert_eq!(tasks[0].status, TaskStatus::New);
        assert_eq!(tasks[1].status, TaskStatus::Completed);
    }

    #[test]
    fn test_rebase_drops_deleted_and_keeps_unconfirmed_creations() {
        let mut gone = Task::new(3, "Gone");
        gone.status = TaskStatus::Deleted;
        let create = Mutation::CreateTask(CreatePayload {
            temp_id: -1,
            title: "Drafted".to_string(),
            description: None,
            priority: Priority::Low,
            task_type: TaskType::Regular,
            due_date: None,
            status: TaskStatus::New,
        });

        let tasks = rebase(vec![Task::new(1, "One"), gone], &[create]);
        let ids: Vec<_> = tasks.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, -1]);
    }

    #[test]
    fn test_only_rejection_requires_revert() {
        assert!(SubmitOutcome::Rejected { reason: "no".into() }.must_revert());
        assert!(!SubmitOutcome::Queued { action_id: 1 }.must_revert());
        assert!(!SubmitOutcome::Accepted { task: None }.must_revert());
        assert!(!SubmitOutcome::Degraded { warning: "w".into() }.must_revert());
    }

    #[test]
    fn test_drain_guard_resets_flag() {
        let flag = AtomicBool::new(true);
        {
            let _guard = DrainGuard(&flag);
        }
        assert!(!flag.load(Ordering::Acquire));
    }
}
