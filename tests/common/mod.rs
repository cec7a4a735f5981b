//! Common test utilities for taskdeck integration tests.
//!
//! Provides `TestEnv` for isolated CLI runs that don't touch the user's
//! data directory, and `MockApi`, an in-memory task server.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use assert_cmd::Command;
use async_trait::async_trait;
pub use tempfile::TempDir;
use uuid::Uuid;

use taskdeck::api::{ApiError, AuthInfo, MutationAck, NetworkError, TaskApi};
use taskdeck::kanban::KanbanEngine;
use taskdeck::models::{Mutation, Task, TaskId};
use taskdeck::storage::{LocalStore, Storage};
use taskdeck::sync::{SyncConfig, SyncCoordinator};

/// Address nothing listens on, so online commands fail fast and queue.
pub const UNREACHABLE_API: &str = "http://127.0.0.1:9/api/mobile.php";

/// A test environment with isolated data storage.
///
/// The `td()` method returns a `Command` that sets `TD_DATA_DIR` and
/// `TD_API_URL` per invocation, making tests parallel-safe.
pub struct TestEnv {
    pub data_dir: TempDir,
    pub config_dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            data_dir: TempDir::new().unwrap(),
            config_dir: TempDir::new().unwrap(),
        }
    }

    /// Create a new test environment and run `td init`.
    pub fn init() -> Self {
        let env = Self::new();
        env.td().arg("init").assert().success();
        env
    }

    /// Get a Command for the td binary with isolated directories.
    pub fn td(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_td"));
        cmd.env("TD_DATA_DIR", self.data_dir.path());
        cmd.env("TD_API_URL", UNREACHABLE_API);
        cmd.env("TD_CONFIG", self.config_dir.path().join("config.kdl"));
        cmd.env_remove("TD_LOG");
        cmd
    }

    pub fn data_path(&self) -> &std::path::Path {
        self.data_dir.path()
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a command's stdout as JSON.
pub fn stdout_json(output: &std::process::Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).expect("stdout is not JSON")
}

/// In-memory task server.
///
/// Moves that would not change anything (same task, same target status)
/// succeed as no-ops, and a repeated idempotency key returns the earlier
/// result, so a replayed action never applies twice.
#[derive(Default)]
pub struct MockApi {
    tasks: Mutex<BTreeMap<TaskId, Task>>,
    /// Every mutation received, in arrival order
    received: Mutex<Vec<(Mutation, Uuid)>>,
    /// Mutations that changed server state, in the order applied
    applied: Mutex<Vec<Mutation>>,
    acks: Mutex<HashMap<Uuid, Option<Task>>>,
    offline: AtomicBool,
    reject_with: Mutex<Option<String>>,
    drop_next_ack: AtomicBool,
    next_id: AtomicI64,
}

impl MockApi {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1000),
            ..Self::default()
        }
    }

    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        let api = Self::new();
        {
            let mut map = api.tasks.lock().unwrap();
            for task in tasks {
                map.insert(task.id, task);
            }
        }
        api
    }

    /// Fail every request with a network error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Refuse every mutation with `reason`.
    pub fn reject_all(&self, reason: Option<&str>) {
        *self.reject_with.lock().unwrap() = reason.map(str::to_string);
    }

    /// Apply the next mutation but lose the response, as if the
    /// connection dropped after the server committed.
    pub fn drop_next_ack(&self) {
        self.drop_next_ack.store(true, Ordering::SeqCst);
    }

    pub fn task(&self, id: TaskId) -> Option<Task> {
        self.tasks.lock().unwrap().get(&id).cloned()
    }

    pub fn received(&self) -> Vec<(Mutation, Uuid)> {
        self.received.lock().unwrap().clone()
    }

    pub fn applied(&self) -> Vec<Mutation> {
        self.applied.lock().unwrap().clone()
    }

    fn apply(&self, mutation: &Mutation) -> Result<Option<Task>, ApiError> {
        let mut tasks = self.tasks.lock().unwrap();
        match mutation {
            Mutation::MoveTask(p) => {
                let task = tasks
                    .get_mut(&p.task_id)
                    .ok_or_else(|| ApiError::Rejected(format!("Task {} not found", p.task_id)))?;
                if task.status != p.new_status {
                    task.status = p.new_status.clone();
                    task.position = p.position as u32;
                    self.applied.lock().unwrap().push(mutation.clone());
                }
                Ok(Some(task.clone()))
            }
            Mutation::CreateTask(p) => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                let mut task = p.to_task();
                task.id = id;
                tasks.insert(id, task.clone());
                self.applied.lock().unwrap().push(mutation.clone());
                Ok(Some(task))
            }
            Mutation::UpdateTask(p) => {
                let task = tasks
                    .get_mut(&p.task_id)
                    .ok_or_else(|| ApiError::Rejected(format!("Task {} not found", p.task_id)))?;
                task.apply_patch(&p.changes);
                self.applied.lock().unwrap().push(mutation.clone());
                Ok(Some(task.clone()))
            }
        }
    }
}

#[async_trait]
impl TaskApi for MockApi {
    async fn auth_check(&self) -> Result<AuthInfo, ApiError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ApiError::Network(NetworkError::Connect("mock offline".into())));
        }
        Ok(AuthInfo {
            authenticated: true,
            user: None,
            csrf_token: Some("mock-token".to_string()),
        })
    }

    async fn fetch_tasks(&self, limit: u32, offset: u32) -> Result<Vec<Task>, ApiError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ApiError::Network(NetworkError::Connect("mock offline".into())));
        }
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .values()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn send(&self, mutation: &Mutation, key: Uuid) -> Result<MutationAck, ApiError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ApiError::Network(NetworkError::Connect("mock offline".into())));
        }
        self.received.lock().unwrap().push((mutation.clone(), key));
        if let Some(reason) = self.reject_with.lock().unwrap().clone() {
            return Err(ApiError::Rejected(reason));
        }

        let existing = self.acks.lock().unwrap().get(&key).cloned();
        let task = match existing {
            Some(task) => task,
            None => {
                let task = self.apply(mutation)?;
                self.acks.lock().unwrap().insert(key, task.clone());
                task
            }
        };

        if self.drop_next_ack.swap(false, Ordering::SeqCst) {
            return Err(ApiError::Network(NetworkError::Timeout));
        }
        Ok(MutationAck { task })
    }
}

/// Engine, coordinator and store wired to a `MockApi`.
pub struct Harness {
    pub api: Arc<MockApi>,
    pub store: LocalStore,
    pub engine: KanbanEngine<MockApi>,
}

impl Harness {
    /// In-memory store seeded with `local`, online or not.
    pub async fn new(api: MockApi, local: Vec<Task>, online: bool) -> Self {
        Self::with_store(api, LocalStore::in_memory().unwrap(), local, online, SyncConfig::default())
            .await
    }

    pub async fn with_store(
        api: MockApi,
        store: LocalStore,
        local: Vec<Task>,
        online: bool,
        config: SyncConfig,
    ) -> Self {
        if !local.is_empty() {
            store.put_tasks(&local).await.unwrap();
        }
        let api = Arc::new(api);
        let sync = SyncCoordinator::new(Arc::clone(&api), store.clone(), config, online);
        let engine = KanbanEngine::new(Arc::new(sync));
        engine.load().await.unwrap();
        Self { api, store, engine }
    }

    /// Open a store persisted in `dir`.
    pub fn store_in(dir: &std::path::Path) -> LocalStore {
        LocalStore::new(Storage::open(dir).unwrap())
    }
}
