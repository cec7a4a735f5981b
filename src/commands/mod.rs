//! Command implementations for the taskdeck CLI.
//!
//! Commands that talk to the board go through a [`Shell`], which owns the
//! store, the proxy worker and the engine for one data directory. The
//! `config` commands only need resolved settings and live in [`config`].

pub mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::api::{ApiError, AuthInfo, HttpApi, ReqwestTransport, TaskApi};
use crate::config::{OutputFormat, Settings};
use crate::kanban::{
    BoardEvent, BoardSnapshot, ChangeReport, KanbanEngine, Notification, engine::NewTask,
};
use crate::models::{Column, FailedAction, OfflineAction, Priority, Task, TaskId, TaskType};
use crate::proxy::{CACHE_FILE, CacheStats, CacheStorage, ProxyHandle};
use crate::storage::{LocalStore, Storage};
use crate::sync::{DrainReport, SyncCoordinator, SyncEvent, SyncReport, SyncTrigger};
use crate::{Error, Result};

/// Command results that can be serialized to JSON or formatted for humans.
pub trait Output {
    /// Serialize to JSON string.
    fn to_json(&self) -> String;

    /// Format for human-readable output.
    fn to_human(&self) -> String;
}

fn json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!(r#"{{"error":"{}"}}"#, e))
}

/// Task API as the CLI uses it: HTTP through the caching proxy.
pub type ShellApi = HttpApi<ProxyHandle>;

/// Everything a board command needs, wired for one data directory.
pub struct Shell {
    data_dir: PathBuf,
    api_url: String,
    proxy: ProxyHandle,
    engine: Arc<KanbanEngine<ShellApi>>,
}

impl Shell {
    /// Open the store, start the proxy and load the board.
    pub async fn open(settings: &Settings, offline: bool) -> Result<Self> {
        let config = &settings.config;
        let store = LocalStore::new(Storage::open(&settings.data_dir)?);

        let transport = ReqwestTransport::new(config.request_timeout()).map_err(ApiError::from)?;
        let cache = CacheStorage::load(&settings.data_dir.join(CACHE_FILE));
        let proxy = ProxyHandle::start(config.proxy_config(), Arc::new(transport), cache).await?;

        let api = HttpApi::new(config.api_url.value.clone(), proxy.clone());
        let sync = SyncCoordinator::new(Arc::new(api), store, config.sync_config(), !offline);
        let engine = Arc::new(KanbanEngine::new(Arc::new(sync)));
        engine.load().await?;

        debug!(data_dir = %settings.data_dir.display(), offline, "shell opened");
        Ok(Self {
            data_dir: settings.data_dir.clone(),
            api_url: config.api_url.value.clone(),
            proxy,
            engine,
        })
    }

    pub fn engine(&self) -> &Arc<KanbanEngine<ShellApi>> {
        &self.engine
    }

    pub fn proxy(&self) -> &ProxyHandle {
        &self.proxy
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Stop the proxy and persist its cache.
    pub async fn close(self) -> Result<()> {
        let storage = self.proxy.shutdown().await?;
        storage.save(&self.data_dir.join(CACHE_FILE))?;
        Ok(())
    }
}

/// Choose the output format: `-H` wins over the configured preference.
pub fn wants_human(flag: bool, settings: &Settings) -> bool {
    flag || settings.config.output_format.value == OutputFormat::Human
}

// === Init ===

#[derive(Serialize)]
pub struct InitResult {
    pub data_dir: PathBuf,
    pub api_url: String,
    pub created: bool,
}

impl Output for InitResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.created {
            format!(
                "Initialized taskdeck store for {} at {}",
                self.api_url,
                self.data_dir.display()
            )
        } else {
            format!("Store already exists at {}", self.data_dir.display())
        }
    }
}

/// Create the local store for the configured server.
pub fn init(settings: &Settings) -> Result<InitResult> {
    let created = !Storage::exists(&settings.data_dir);
    Storage::open(&settings.data_dir)?;
    if created {
        info!(data_dir = %settings.data_dir.display(), "store created");
    }
    Ok(InitResult {
        data_dir: settings.data_dir.clone(),
        api_url: settings.config.api_url.value.clone(),
        created,
    })
}

// === Auth ===

#[derive(Serialize)]
pub struct AuthResult {
    pub api_url: String,
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<serde_json::Value>,
    pub csrf_token_issued: bool,
}

impl Output for AuthResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut lines = vec![format!("Server: {}", self.api_url)];
        if self.authenticated {
            let who = self
                .user
                .as_ref()
                .and_then(|u| u.get("name").or_else(|| u.get("username")))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown user");
            lines.push(format!("Authenticated as {}", who));
        } else {
            lines.push("Not authenticated".to_string());
        }
        if self.csrf_token_issued {
            lines.push("CSRF token issued".to_string());
        }
        lines.join("\n")
    }
}

/// Check the server session.
pub async fn auth(shell: &Shell) -> Result<AuthResult> {
    let AuthInfo {
        authenticated,
        user,
        csrf_token,
    } = shell.engine.sync().api().auth_check().await?;
    Ok(AuthResult {
        api_url: shell.api_url.clone(),
        authenticated,
        user,
        csrf_token_issued: csrf_token.is_some(),
    })
}

// === Sync ===

#[derive(Serialize)]
pub struct SyncResult {
    #[serde(flatten)]
    pub report: SyncReport,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notifications: Vec<Notification>,
}

impl Output for SyncResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut lines = vec![drain_summary(&self.report.drain)];
        if let Some(count) = self.report.tasks {
            lines.push(format!("Reloaded {} tasks from the server", count));
        }
        lines.extend(self.notifications.iter().map(Notification::render));
        lines.join("\n")
    }
}

/// Deliver queued changes and refresh from the server.
pub async fn sync(shell: &Shell, full: bool) -> Result<SyncResult> {
    let seen = last_notification(&shell.engine);
    let report = shell.engine.sync_now(full).await?;
    Ok(SyncResult {
        report,
        notifications: new_notifications(&shell.engine, seen),
    })
}

/// Id of the newest notification so far, 0 when there is none.
fn last_notification(engine: &KanbanEngine<ShellApi>) -> u64 {
    engine.notifications().last().map(|n| n.id).unwrap_or(0)
}

fn new_notifications(engine: &KanbanEngine<ShellApi>, seen: u64) -> Vec<Notification> {
    engine
        .notifications()
        .into_iter()
        .filter(|n| n.id > seen)
        .collect()
}

fn drain_summary(report: &DrainReport) -> String {
    if report.skipped {
        return "Queue not drained (offline or already draining)".to_string();
    }
    let mut summary = format!(
        "Delivered {} queued action{}",
        report.delivered.len(),
        if report.delivered.len() == 1 { "" } else { "s" }
    );
    if !report.failed.is_empty() {
        summary.push_str(&format!(", {} set aside", report.failed.len()));
    }
    if let Some(id) = report.stalled_on {
        summary.push_str(&format!(", stopped at action {}", id));
    }
    summary.push_str(&format!(", {} still queued", report.remaining));
    summary
}

// === Board ===

#[derive(Serialize)]
pub struct BoardResult {
    #[serde(flatten)]
    pub board: BoardSnapshot,
    pub pending_actions: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
}

impl Output for BoardResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut lines = Vec::new();
        for view in &self.board.columns {
            lines.push(format!("{} ({})", view.title, view.tasks.len()));
            for task in &view.tasks {
                let in_flight = self.board.in_flight.contains(&task.id);
                lines.push(format!("  {}", task_line(task, in_flight)));
            }
            lines.push(String::new());
        }
        lines.push(format!("{} queued action(s)", self.pending_actions));
        match self.last_sync {
            Some(at) => lines.push(format!("Last sync: {}", at.format("%Y-%m-%d %H:%M UTC"))),
            None => lines.push("Never synced".to_string()),
        }
        lines.join("\n")
    }
}

fn task_line(task: &Task, in_flight: bool) -> String {
    let mut line = format!("#{} [{}] {}", task.id, task.priority.as_str(), task.title);
    if let Some(progress) = task.progress {
        line.push_str(&format!(" {}%", progress));
    }
    if let Some(due) = task.due_date {
        line.push_str(&format!(" (due {})", due));
    }
    if task.is_temporary() {
        line.push_str(" (local)");
    }
    if in_flight {
        line.push_str(" (syncing)");
    }
    line
}

/// Show the board.
pub async fn board(shell: &Shell) -> Result<BoardResult> {
    let store = shell.engine.sync().store();
    Ok(BoardResult {
        board: shell.engine.snapshot(),
        pending_actions: store.count_actions().await?,
        last_sync: store.get_last_sync().await?,
    })
}

// === Tasks ===

#[derive(Serialize)]
pub struct ChangeOutput {
    #[serde(flatten)]
    pub report: ChangeReport,
}

impl Output for ChangeOutput {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        use crate::kanban::ChangeStatus;

        let report = &self.report;
        let mut lines = Vec::new();
        let headline = match (&report.status, &report.task) {
            (ChangeStatus::Reverted, _) => format!("Change to task {} was reverted", report.task_id),
            (ChangeStatus::Deferred, _) => {
                format!("Change to task {} is waiting for an earlier one", report.task_id)
            }
            (_, Some(task)) => format!(
                "{} -> {}",
                task_line(task, false),
                task.column().title()
            ),
            (_, None) => format!("Updated task {}", report.task_id),
        };
        lines.push(headline);
        lines.extend(report.notifications.iter().map(Notification::render));
        lines.join("\n")
    }
}

/// Create a task in To Do.
pub async fn task_create(
    shell: &Shell,
    title: String,
    description: Option<String>,
    priority: Priority,
    calendar: bool,
    due_date: Option<chrono::NaiveDate>,
) -> Result<ChangeOutput> {
    let new = NewTask {
        title,
        description,
        priority,
        task_type: if calendar {
            TaskType::Calendar
        } else {
            TaskType::Regular
        },
        due_date,
    };
    let report = shell.engine.create_task(new).await?;
    Ok(ChangeOutput { report })
}

/// Move a task to `to`, at `index` or the bottom.
pub async fn task_move(
    shell: &Shell,
    id: TaskId,
    to: Column,
    index: Option<usize>,
) -> Result<ChangeOutput> {
    let id = shell.engine.sync().store().resolve_alias(id).await?;
    let report = shell.engine.move_to(id, to, index).await?;
    Ok(ChangeOutput { report })
}

pub async fn task_complete(shell: &Shell, id: TaskId) -> Result<ChangeOutput> {
    let id = shell.engine.sync().store().resolve_alias(id).await?;
    let report = shell.engine.complete_task(id).await?;
    Ok(ChangeOutput { report })
}

pub async fn task_progress(shell: &Shell, id: TaskId, percent: u8) -> Result<ChangeOutput> {
    let id = shell.engine.sync().store().resolve_alias(id).await?;
    let report = shell.engine.update_progress(id, percent).await?;
    Ok(ChangeOutput { report })
}

#[derive(Serialize)]
pub struct TaskShowResult {
    pub task: Task,
    pub column: Column,
    pub pending_actions: Vec<OfflineAction>,
}

impl Output for TaskShowResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let task = &self.task;
        let mut lines = vec![
            task_line(task, false),
            format!("  Column:   {}", self.column.title()),
            format!("  Status:   {}", task.status.as_str()),
            format!("  Type:     {}", task.task_type.as_str()),
        ];
        if let Some(ref description) = task.description {
            lines.push(format!("  {}", description));
        }
        if !self.pending_actions.is_empty() {
            lines.push(format!("  {} change(s) waiting to sync", self.pending_actions.len()));
        }
        lines.join("\n")
    }
}

/// Show one task with its queued changes.
pub async fn task_show(shell: &Shell, id: TaskId) -> Result<TaskShowResult> {
    let store = shell.engine.sync().store();
    let id = store.resolve_alias(id).await?;
    let task = match shell.engine.task(id) {
        Some(task) => task,
        None => store
            .get_task(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("task {}", id)))?,
    };

    let mut pending_actions = Vec::new();
    for action in shell.engine.sync().queue().pending().await? {
        if store.resolve_alias(action.mutation.task_id()).await? == id {
            pending_actions.push(action);
        }
    }

    Ok(TaskShowResult {
        column: task.column(),
        task,
        pending_actions,
    })
}

// === Queue ===

#[derive(Serialize)]
pub struct QueueListResult {
    pub actions: Vec<OfflineAction>,
}

impl Output for QueueListResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.actions.is_empty() {
            return "Queue is empty".to_string();
        }
        self.actions
            .iter()
            .map(|a| {
                let mut line = format!(
                    "{:>4}  {:<12} task {:<6} {}",
                    a.id,
                    a.mutation.action_type(),
                    a.mutation.task_id(),
                    a.timestamp.format("%Y-%m-%d %H:%M:%S")
                );
                if a.attempts > 0 {
                    line.push_str(&format!("  ({} attempt(s)", a.attempts));
                    if let Some(ref error) = a.last_error {
                        line.push_str(&format!(": {}", error));
                    }
                    line.push(')');
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub async fn queue_list(shell: &Shell) -> Result<QueueListResult> {
    Ok(QueueListResult {
        actions: shell.engine.sync().queue().pending().await?,
    })
}

#[derive(Serialize)]
pub struct DrainResult {
    #[serde(flatten)]
    pub report: DrainReport,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notifications: Vec<Notification>,
}

impl Output for DrainResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut lines = vec![drain_summary(&self.report)];
        lines.extend(self.notifications.iter().map(Notification::render));
        lines.join("\n")
    }
}

pub async fn queue_drain(shell: &Shell) -> Result<DrainResult> {
    let seen = last_notification(&shell.engine);
    let report = shell.engine.drain().await?;
    Ok(DrainResult {
        report,
        notifications: new_notifications(&shell.engine, seen),
    })
}

#[derive(Serialize)]
pub struct QueueFailedResult {
    pub failed: Vec<FailedAction>,
}

impl Output for QueueFailedResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.failed.is_empty() {
            return "No failed actions".to_string();
        }
        self.failed
            .iter()
            .map(|f| {
                format!(
                    "{:>4}  {:<12} task {:<6} {}",
                    f.action.id,
                    f.action.mutation.action_type(),
                    f.action.mutation.task_id(),
                    f.reason
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub async fn queue_failed(shell: &Shell) -> Result<QueueFailedResult> {
    Ok(QueueFailedResult {
        failed: shell.engine.sync().queue().failed().await?,
    })
}

#[derive(Serialize)]
pub struct QueueRetryResult {
    pub action: OfflineAction,
}

impl Output for QueueRetryResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!(
            "Requeued {} for task {} as action {}",
            self.action.mutation.action_type(),
            self.action.mutation.task_id(),
            self.action.id
        )
    }
}

/// Put a failed action back on the queue with a fresh attempt budget.
pub async fn queue_retry(shell: &Shell, id: i64) -> Result<QueueRetryResult> {
    let action = shell.engine.sync().queue().retry_failed(id).await?;
    Ok(QueueRetryResult { action })
}

#[derive(Serialize)]
pub struct QueueDiscardResult {
    pub id: i64,
}

impl Output for QueueDiscardResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!(
            "Discarded failed action {}. Run `td sync --full` to restore the server's copy.",
            self.id
        )
    }
}

pub async fn queue_discard(shell: &Shell, id: i64) -> Result<QueueDiscardResult> {
    if !shell.engine.sync().queue().discard_failed(id).await? {
        return Err(Error::NotFound(format!("failed action {}", id)));
    }
    Ok(QueueDiscardResult { id })
}

// === Cache ===

#[derive(Serialize)]
pub struct CacheStatsResult {
    #[serde(flatten)]
    pub stats: CacheStats,
}

impl Output for CacheStatsResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut lines = vec![format!(
            "Proxy {} ({:?})",
            self.stats.version, self.stats.state
        )];
        for partition in &self.stats.partitions {
            let cap = partition
                .cap
                .map(|c| format!("/{}", c))
                .unwrap_or_default();
            lines.push(format!("  {:<32} {}{}", partition.name, partition.entries, cap));
        }
        lines.join("\n")
    }
}

pub async fn cache_stats(shell: &Shell) -> Result<CacheStatsResult> {
    Ok(CacheStatsResult {
        stats: shell.proxy.stats().await?,
    })
}

#[derive(Serialize)]
pub struct CacheClearResult {
    pub partitions_deleted: usize,
}

impl Output for CacheClearResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!("Deleted {} cache partition(s)", self.partitions_deleted)
    }
}

pub async fn cache_clear(shell: &Shell) -> Result<CacheClearResult> {
    Ok(CacheClearResult {
        partitions_deleted: shell.proxy.clear_caches().await?,
    })
}

// === Reset ===

#[derive(Serialize)]
pub struct ResetResult {
    pub data_dir: PathBuf,
    pub partitions_deleted: usize,
}

impl Output for ResetResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!(
            "Cleared local tasks, queued actions and {} cache partition(s) in {}",
            self.partitions_deleted,
            self.data_dir.display()
        )
    }
}

/// Drop every local task, queued and failed action, and cached response.
pub async fn reset(shell: &Shell, confirmed: bool) -> Result<ResetResult> {
    if !confirmed {
        return Err(Error::InvalidInput(
            "reset deletes unsynced changes; pass --yes to confirm".to_string(),
        ));
    }
    shell.engine.sync().store().clear_all().await?;
    let partitions_deleted = shell.proxy.clear_caches().await?;
    shell.engine.load().await?;
    warn!(data_dir = %shell.data_dir.display(), "local state reset");
    Ok(ResetResult {
        data_dir: shell.data_dir.clone(),
        partitions_deleted,
    })
}

// === Watch ===

/// One line of `td watch` output.
#[derive(Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
enum WatchLine<'a> {
    Board { event: &'a BoardEvent },
    Sync { event: &'a SyncEvent },
}

fn print_watch_line(line: &WatchLine<'_>, human: bool) {
    if !human {
        println!("{}", json(line));
        return;
    }
    match line {
        WatchLine::Board {
            event: BoardEvent::Notification(n),
        } => println!("{}", n.render()),
        WatchLine::Board {
            event: BoardEvent::Rendered(snapshot),
        } => {
            let counts: Vec<String> = snapshot
                .columns
                .iter()
                .map(|c| format!("{} {}", c.title, c.tasks.len()))
                .collect();
            println!("board: {}", counts.join(" | "));
        }
        WatchLine::Sync { event } => match event {
            SyncEvent::ConnectivityChanged { online } => {
                println!("{}", if *online { "online" } else { "offline" })
            }
            SyncEvent::Queued { action_id, task_id } => {
                println!("queued action {} for task {}", action_id, task_id)
            }
            SyncEvent::Drained(report) => println!("{}", drain_summary(report)),
            SyncEvent::Synced(report) => println!("{}", drain_summary(&report.drain)),
            SyncEvent::StorageDegraded { message } => println!("storage degraded: {}", message),
            SyncEvent::SyncFailed { message } => println!("sync failed: {}", message),
        },
    }
}

/// Run the sync loop and print events until Ctrl-C.
pub async fn watch(shell: &Shell, human: bool) -> Result<()> {
    let sync = Arc::clone(shell.engine.sync());
    let mut sync_events = sync.subscribe();
    let mut board_events = shell.engine.subscribe();

    let (trigger_tx, trigger_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = {
        let sync = Arc::clone(&sync);
        tokio::spawn(async move { sync.run(trigger_rx, shutdown_rx).await })
    };

    if trigger_tx.send(SyncTrigger::Manual).await.is_err() {
        warn!("sync loop exited before the first trigger");
    }
    info!(data_dir = %shell.data_dir.display(), "watching");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            event = sync_events.recv() => match event {
                Ok(event) => {
                    print_watch_line(&WatchLine::Sync { event: &event }, human);
                    if matches!(event, SyncEvent::Drained(_) | SyncEvent::Synced(_)) {
                        shell.engine.reload().await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => debug!(skipped = n, "sync events lagged"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = board_events.recv() => match event {
                Ok(event) => print_watch_line(&WatchLine::Board { event: &event }, human),
                Err(broadcast::error::RecvError::Lagged(n)) => debug!(skipped = n, "board events lagged"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = runner.await {
        warn!(error = %e, "sync loop task failed");
    }
    Ok(())
}
