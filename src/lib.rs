//! taskdeck - an offline-capable task sync and Kanban engine.
//!
//! This library provides the core of the `td` CLI: a local task store
//! with an offline action queue, a caching network proxy, the sync
//! coordinator that replays queued changes, and the Kanban board state
//! machine that applies changes optimistically and reverts rejected ones.

pub mod api;
pub mod cli;
pub mod commands;
pub mod config;
pub mod kanban;
pub mod models;
pub mod proxy;
pub mod storage;
pub mod sync;

/// Library-level error type for taskdeck operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] storage::StorageError),

    #[error(transparent)]
    Api(#[from] api::ApiError),

    #[error(transparent)]
    Proxy(#[from] proxy::ProxyError),

    #[error(transparent)]
    Kanban(#[from] kanban::KanbanError),

    #[error(transparent)]
    Sync(#[from] sync::SyncError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for taskdeck operations.
pub type Result<T> = std::result::Result<T, Error>;
