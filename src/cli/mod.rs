//! CLI argument definitions for taskdeck.

use chrono::NaiveDate;
use clap::{Parser, Subcommand};

use crate::models::{Column, Priority, TaskId};

/// Version string with build metadata, for `td --version`.
pub const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("TD_GIT_COMMIT"),
    ", built ",
    env!("TD_BUILD_TIMESTAMP"),
    ")"
);

/// taskdeck - an offline-capable Kanban board for a remote task server.
///
/// Changes are applied locally first and delivered when the server is
/// reachable; anything that cannot be delivered is queued and replayed later.
#[derive(Parser, Debug)]
#[command(name = "td")]
#[command(author, version, long_version = LONG_VERSION, about = "Offline-capable task sync and Kanban board", long_about = None)]
pub struct Cli {
    /// Output in human-readable format instead of JSON
    #[arg(short = 'H', long = "human", global = true)]
    pub human_readable: bool,

    /// Do not contact the server; every change is queued
    #[arg(long, global = true)]
    pub offline: bool,

    /// Task API endpoint. Can also be set via TD_API_URL.
    #[arg(long, global = true)]
    pub api_url: Option<String>,

    /// Emit logs on stderr as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the local store for the configured server
    Init,

    /// Check the server session
    Auth,

    /// Deliver queued changes and refresh tasks from the server
    Sync {
        /// Reload every task even if the last sync is recent
        #[arg(long)]
        full: bool,
    },

    /// Show the board
    Board,

    /// Task commands
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },

    /// Move a task to another column
    Move {
        /// Task ID (negative for tasks not yet confirmed by the server)
        #[arg(allow_negative_numbers = true)]
        id: TaskId,

        /// Target column (todo, in_progress, done)
        #[arg(value_parser = parse_column)]
        to: Column,

        /// Position in the target column (default: bottom)
        #[arg(long)]
        index: Option<usize>,
    },

    /// Offline action queue commands
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Run the sync loop until interrupted, printing board and sync events
    Watch,

    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Cache commands for the network proxy
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Delete every locally stored task, queued action and cached response
    Reset {
        /// Required to confirm the reset
        #[arg(long)]
        yes: bool,
    },
}

/// Task subcommands
#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// Create a task in the To Do column
    Create {
        /// Task title
        title: String,

        /// Task description
        #[arg(short, long)]
        description: Option<String>,

        /// Priority (high, medium, low)
        #[arg(short, long, value_parser = parse_priority, default_value = "medium")]
        priority: Priority,

        /// Create a calendar task (tracks progress)
        #[arg(long)]
        calendar: bool,

        /// Due date (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        due: Option<NaiveDate>,
    },

    /// Show a task
    Show {
        /// Task ID
        #[arg(allow_negative_numbers = true)]
        id: TaskId,
    },

    /// Mark a task completed
    Complete {
        /// Task ID
        #[arg(allow_negative_numbers = true)]
        id: TaskId,
    },

    /// Set progress on a calendar task
    Progress {
        /// Task ID
        #[arg(allow_negative_numbers = true)]
        id: TaskId,

        /// Percentage (0-100)
        #[arg(value_parser = clap::value_parser!(u8).range(0..=100))]
        percent: u8,
    },
}

/// Queue subcommands
#[derive(Subcommand, Debug)]
pub enum QueueCommands {
    /// List queued actions in replay order
    List,

    /// Replay queued actions now
    Drain,

    /// List actions set aside after failing
    Failed,

    /// Put a failed action back at the end of the queue
    Retry {
        /// Failed action ID
        id: i64,
    },

    /// Drop a failed action for good
    Discard {
        /// Failed action ID
        id: i64,
    },
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show every setting with the layer it came from
    Show,

    /// Get a configuration value
    Get {
        /// Configuration key (e.g. max-attempts, cache.images)
        key: String,
    },

    /// Set a configuration value in the session config
    Set {
        /// Configuration key (e.g. max-attempts, cache.images)
        key: String,
        /// Configuration value
        value: String,
    },
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Show proxy state and partition sizes
    Stats,

    /// Delete every cache partition
    Clear,
}

fn parse_column(s: &str) -> Result<Column, String> {
    Column::parse(s).ok_or_else(|| format!("unknown column '{}' (todo, in_progress, done)", s))
}

fn parse_priority(s: &str) -> Result<Priority, String> {
    Priority::parse(s).ok_or_else(|| format!("unknown priority '{}' (high, medium, low)", s))
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| format!("invalid date '{}': {}", s, e))
}
