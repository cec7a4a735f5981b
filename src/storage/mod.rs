//! Local Store for taskdeck data.
//!
//! Durable client-side persistence for the task snapshot, the offline action
//! log and sync metadata, kept in a single SQLite database:
//!
//! - `tasks` - current task snapshot keyed by id, indexed on status,
//!   priority, type and due date
//! - `offline_actions` - ordered mutation log (auto-increment id), indexed on
//!   timestamp and action type
//! - `failed_actions` - actions set aside after a permanent failure
//! - `task_aliases` - temporary id -> server id for confirmed offline creations
//! - `sync_metadata` - fixed-key rows (`last_sync`)
//!
//! [`Storage`] is the synchronous engine; [`LocalStore`] is the async handle
//! the rest of the crate shares; [`OfflineQueue`] is the retry-aware view over
//! the action log.

pub mod local;
pub mod queue;

pub use local::LocalStore;
pub use queue::{OfflineQueue, QueueDisposition, RetryPolicy};

use crate::models::{FailedAction, Mutation, OfflineAction, SyncMetadata, Task, TaskId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "TD_DATA_DIR";

/// Database file name inside the data directory.
const DB_FILE: &str = "taskdeck.db";

/// Fixed key of the last-sync metadata row.
const LAST_SYNC_KEY: &str = "last_sync";

/// Errors raised by the Local Store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Local store is corrupt: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record not found: {0}")]
    NotFound(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(ErrorCode::DiskFull) => StorageError::QuotaExceeded(e.to_string()),
            Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
                StorageError::Corrupt(e.to_string())
            }
            _ => StorageError::Database(e),
        }
    }
}

/// Result type alias for Local Store operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// SQLite-backed Local Store.
pub struct Storage {
    /// Directory holding the database file (None for in-memory stores)
    root: Option<PathBuf>,
    conn: Connection,
}

impl Storage {
    /// Open or create the store inside `dir`.
    pub fn open(dir: &Path) -> StorageResult<Self> {
        fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join(DB_FILE))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            root: Some(dir.to_path_buf()),
            conn,
        })
    }

    /// Open a throwaway in-memory store.
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { root: None, conn })
    }

    /// Check if a store exists inside `dir`.
    pub fn exists(dir: &Path) -> bool {
        dir.join(DB_FILE).exists()
    }

    /// Directory holding the database file.
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Initialize the SQLite schema.
    fn init_schema(conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY,
                status TEXT NOT NULL,
                priority TEXT NOT NULL,
                type TEXT NOT NULL,
                due_date TEXT,
                position INTEGER NOT NULL DEFAULT 0,
                data TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_priority ON tasks(priority);
            CREATE INDEX IF NOT EXISTS idx_tasks_type ON tasks(type);
            CREATE INDEX IF NOT EXISTS idx_tasks_due_date ON tasks(due_date);

            CREATE TABLE IF NOT EXISTS offline_actions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                client_ref TEXT NOT NULL UNIQUE,
                action_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_actions_timestamp ON offline_actions(timestamp);
            CREATE INDEX IF NOT EXISTS idx_actions_type ON offline_actions(action_type);

            CREATE TABLE IF NOT EXISTS failed_actions (
                id INTEGER PRIMARY KEY,
                client_ref TEXT NOT NULL,
                action_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                last_error TEXT,
                failed_at TEXT NOT NULL,
                reason TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS task_aliases (
                temp_id INTEGER PRIMARY KEY,
                server_id INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sync_metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    // === Task Operations ===

    /// Replace the whole task collection in one transaction.
    ///
    /// Readers observe either the old or the new collection, never a mix.
    pub fn put_tasks(&mut self, tasks: &[Task]) -> StorageResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM tasks", [])?;
        for task in tasks {
            insert_task(&tx, task)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Return the full snapshot ordered by position, then id.
    pub fn get_all_tasks(&self) -> StorageResult<Vec<Task>> {
        let mut stmt = self
            .conn
            .prepare("SELECT data FROM tasks ORDER BY position ASC, id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut tasks = Vec::new();
        for data in rows {
            tasks.push(serde_json::from_str(&data?)?);
        }
        Ok(tasks)
    }

    /// Get a task by ID.
    pub fn get_task(&self, id: TaskId) -> StorageResult<Option<Task>> {
        let data: Option<String> = self
            .conn
            .query_row("SELECT data FROM tasks WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    /// Insert or overwrite a single task record.
    pub fn upsert_task(&mut self, task: &Task) -> StorageResult<()> {
        insert_task(&self.conn, task)
    }

    /// Drop a task that only ever existed locally (a creation the server
    /// refused). Server-known tasks are only removed by a full sync.
    pub fn remove_local_task(&mut self, id: TaskId) -> StorageResult<bool> {
        if id >= 0 {
            return Ok(false);
        }
        Ok(self.conn.execute("DELETE FROM tasks WHERE id = ?1", [id])? > 0)
    }

    /// Replace an offline-created task with its server-confirmed record.
    pub fn confirm_task(&mut self, temp_id: TaskId, task: &Task) -> StorageResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM tasks WHERE id = ?1", [temp_id])?;
        insert_task(&tx, task)?;
        tx.execute(
            "INSERT OR REPLACE INTO task_aliases (temp_id, server_id) VALUES (?1, ?2)",
            params![temp_id, task.id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Resolve a possibly-temporary id to the id the server knows.
    pub fn resolve_alias(&self, id: TaskId) -> StorageResult<TaskId> {
        if id >= 0 {
            return Ok(id);
        }
        let server_id: Option<TaskId> = self
            .conn
            .query_row(
                "SELECT server_id FROM task_aliases WHERE temp_id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(server_id.unwrap_or(id))
    }

    /// Allocate the next temporary (negative) task id.
    ///
    /// Aliased ids are never handed out again so queued actions keep resolving.
    pub fn next_temp_id(&self) -> StorageResult<TaskId> {
        let lowest: TaskId = self.conn.query_row(
            "SELECT MIN(id) FROM (
                SELECT MIN(id, 0) AS id FROM tasks
                UNION ALL SELECT MIN(temp_id, 0) FROM task_aliases
                UNION ALL SELECT 0
            )",
            [],
            |row| row.get(0),
        )?;
        Ok(lowest - 1)
    }

    // === Offline Action Operations ===

    /// Append a mutation to the action log.
    pub fn enqueue_action(
        &mut self,
        mutation: &Mutation,
        client_ref: Uuid,
    ) -> StorageResult<OfflineAction> {
        let timestamp = Utc::now();
        let payload = payload_json(mutation)?;
        self.conn.execute(
            "INSERT INTO offline_actions (client_ref, action_type, payload, timestamp, attempts)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![
                client_ref.to_string(),
                mutation.action_type(),
                payload,
                timestamp.to_rfc3339()
            ],
        )?;

        Ok(OfflineAction {
            id: self.conn.last_insert_rowid(),
            client_ref,
            mutation: mutation.clone(),
            timestamp,
            attempts: 0,
            last_error: None,
        })
    }

    /// List queued actions in insertion order.
    pub fn list_actions(&self) -> StorageResult<Vec<OfflineAction>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, client_ref, action_type, payload, timestamp, attempts, last_error
             FROM offline_actions ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], RawAction::from_row)?;

        let mut actions = Vec::new();
        for raw in rows {
            actions.push(raw?.decode()?);
        }
        Ok(actions)
    }

    /// Count queued actions.
    pub fn count_actions(&self) -> StorageResult<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM offline_actions", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Record a failed delivery attempt and return the new attempt count.
    pub fn record_attempt(&mut self, id: i64, error: &str) -> StorageResult<u32> {
        let changed = self.conn.execute(
            "UPDATE offline_actions SET attempts = attempts + 1, last_error = ?2 WHERE id = ?1",
            params![id, error],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("offline action {}", id)));
        }
        let attempts: u32 = self.conn.query_row(
            "SELECT attempts FROM offline_actions WHERE id = ?1",
            [id],
            |row| row.get(0),
        )?;
        Ok(attempts)
    }

    /// Delete a queued action after confirmed replay.
    pub fn remove_action(&mut self, id: i64) -> StorageResult<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM offline_actions WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }

    /// Move a queued action to the failed set.
    pub fn mark_failed(&mut self, id: i64, reason: &str) -> StorageResult<FailedAction> {
        let failed_at = Utc::now();
        let tx = self.conn.transaction()?;
        let copied = tx.execute(
            "INSERT INTO failed_actions
                (id, client_ref, action_type, payload, timestamp, attempts, last_error, failed_at, reason)
             SELECT id, client_ref, action_type, payload, timestamp, attempts, last_error, ?2, ?3
             FROM offline_actions WHERE id = ?1",
            params![id, failed_at.to_rfc3339(), reason],
        )?;
        if copied == 0 {
            return Err(StorageError::NotFound(format!("offline action {}", id)));
        }
        tx.execute("DELETE FROM offline_actions WHERE id = ?1", [id])?;
        tx.commit()?;

        self.get_failed(id)?
            .ok_or_else(|| StorageError::NotFound(format!("failed action {}", id)))
    }

    /// Get a failed action by id.
    pub fn get_failed(&self, id: i64) -> StorageResult<Option<FailedAction>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, client_ref, action_type, payload, timestamp, attempts, last_error, failed_at, reason
             FROM failed_actions WHERE id = ?1",
        )?;
        let row = stmt
            .query_row([id], |row| {
                Ok((RawAction::from_row(row)?, row.get::<_, String>(7)?, row.get::<_, String>(8)?))
            })
            .optional()?;
        match row {
            Some((raw, failed_at, reason)) => Ok(Some(FailedAction {
                action: raw.decode()?,
                failed_at: parse_timestamp(&failed_at)?,
                reason,
            })),
            None => Ok(None),
        }
    }

    /// List permanently failed actions, oldest first.
    pub fn list_failed(&self) -> StorageResult<Vec<FailedAction>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, client_ref, action_type, payload, timestamp, attempts, last_error, failed_at, reason
             FROM failed_actions ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((RawAction::from_row(row)?, row.get::<_, String>(7)?, row.get::<_, String>(8)?))
        })?;

        let mut failed = Vec::new();
        for row in rows {
            let (raw, failed_at, reason) = row?;
            failed.push(FailedAction {
                action: raw.decode()?,
                failed_at: parse_timestamp(&failed_at)?,
                reason,
            });
        }
        Ok(failed)
    }

    /// Put a failed action back at the tail of the queue with a fresh attempt budget.
    pub fn requeue_failed(&mut self, id: i64) -> StorageResult<OfflineAction> {
        let failed = self
            .get_failed(id)?
            .ok_or_else(|| StorageError::NotFound(format!("failed action {}", id)))?;

        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM failed_actions WHERE id = ?1", [id])?;
        let timestamp = Utc::now();
        tx.execute(
            "INSERT INTO offline_actions (client_ref, action_type, payload, timestamp, attempts)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![
                failed.action.client_ref.to_string(),
                failed.action.mutation.action_type(),
                payload_json(&failed.action.mutation)?,
                timestamp.to_rfc3339()
            ],
        )?;
        let new_id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(OfflineAction {
            id: new_id,
            client_ref: failed.action.client_ref,
            mutation: failed.action.mutation,
            timestamp,
            attempts: 0,
            last_error: None,
        })
    }

    /// Drop a failed action for good.
    pub fn discard_failed(&mut self, id: i64) -> StorageResult<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM failed_actions WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }

    // === Sync Metadata ===

    /// Overwrite the last-sync timestamp.
    pub fn set_last_sync(&mut self, timestamp: DateTime<Utc>) -> StorageResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO sync_metadata (key, value) VALUES (?1, ?2)",
            params![LAST_SYNC_KEY, timestamp.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Get the last-sync timestamp, if any sync completed.
    pub fn get_last_sync(&self) -> StorageResult<Option<DateTime<Utc>>> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM sync_metadata WHERE key = ?1",
                [LAST_SYNC_KEY],
                |row| row.get(0),
            )
            .optional()?;
        value.as_deref().map(parse_timestamp).transpose()
    }

    /// Get the sync metadata row.
    pub fn sync_metadata(&self) -> StorageResult<SyncMetadata> {
        Ok(SyncMetadata {
            last_sync: self.get_last_sync()?,
        })
    }

    /// Wipe every table (full local cache clear).
    pub fn clear_all(&mut self) -> StorageResult<()> {
        self.conn.execute_batch(
            r#"
            DELETE FROM tasks;
            DELETE FROM offline_actions;
            DELETE FROM failed_actions;
            DELETE FROM task_aliases;
            DELETE FROM sync_metadata;
            "#,
        )?;
        Ok(())
    }
}

/// Insert or replace one task row.
fn insert_task(conn: &Connection, task: &Task) -> StorageResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO tasks (id, status, priority, type, due_date, position, data)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            task.id,
            task.status.as_str(),
            task.priority.as_str(),
            task.task_type.as_str(),
            task.due_date.map(|d| d.to_string()),
            task.position,
            serde_json::to_string(task)?
        ],
    )?;
    Ok(())
}

/// Serialize only the payload half of a mutation.
fn payload_json(mutation: &Mutation) -> StorageResult<String> {
    let value = serde_json::to_value(mutation)?;
    Ok(value["payload"].to_string())
}

fn parse_timestamp(s: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("bad timestamp '{}': {}", s, e)))
}

/// Undecoded `offline_actions` / `failed_actions` row.
struct RawAction {
    id: i64,
    client_ref: String,
    action_type: String,
    payload: String,
    timestamp: String,
    attempts: u32,
    last_error: Option<String>,
}

impl RawAction {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            client_ref: row.get(1)?,
            action_type: row.get(2)?,
            payload: row.get(3)?,
            timestamp: row.get(4)?,
            attempts: row.get(5)?,
            last_error: row.get(6)?,
        })
    }

    fn decode(self) -> StorageResult<OfflineAction> {
        let payload: serde_json::Value = serde_json::from_str(&self.payload)?;
        let mutation: Mutation = serde_json::from_value(serde_json::json!({
            "action_type": self.action_type,
            "payload": payload,
        }))?;
        let client_ref = Uuid::parse_str(&self.client_ref)
            .map_err(|e| StorageError::Corrupt(format!("bad client_ref: {}", e)))?;

        Ok(OfflineAction {
            id: self.id,
            client_ref,
            mutation,
            timestamp: parse_timestamp(&self.timestamp)?,
            attempts: self.attempts,
            last_error: self.last_error,
        })
    }
}

/// Get the data directory for an API base URL.
///
/// `TD_DATA_DIR` wins when set; otherwise the directory is
/// `<data_dir>/taskdeck/<12 hex chars of sha256(api_url)>`.
pub fn get_storage_dir(api_url: &str) -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }

    let data_dir = dirs::data_dir()
        .ok_or_else(|| Error::Other("Could not determine data directory".to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(api_url.trim_end_matches('/').as_bytes());
    let hash_hex = format!("{:x}", hasher.finalize());

    Ok(data_dir.join("taskdeck").join(&hash_hex[..12]))
}
