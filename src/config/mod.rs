//! Configuration for taskdeck.
//!
//! ## config.kdl
//!
//! Located at:
//! - System: `~/.config/taskdeck/config.kdl` (or `$TD_CONFIG`)
//! - Session: `<data-dir>/config.kdl`
//!
//! Contains the API endpoint, request timeout, sync tuning
//! (`page-size`, `max-attempts`, `drain-interval-secs`,
//! `full-sync-after-hours`), `output-format`, proxy cache caps and
//! passthrough prefixes. See [`schema::TaskdeckConfig`].
//!
//! ## Precedence
//!
//! CLI flag > `TD_API_URL` > session config > system config > defaults.
//! Use the [`resolver`] module for resolution with source tracking.

pub mod resolver;
pub mod schema;

pub use resolver::{
    API_URL_ENV, CONFIG_PATH_ENV, ConfigOverrides, Resolved, ResolvedConfig, Settings,
    ValueSource, resolve_config, session_config_path, system_config_path,
};
pub use schema::{CacheConfig, OutputFormat, TaskdeckConfig};
