//! Network Proxy.
//!
//! The proxy is an independent actor that owns the cache partitions. The
//! application side talks to it only through a [`ProxyHandle`], which sends
//! typed [`worker::ProxyCommand`] messages and awaits the reply. Requests
//! are classified ([`strategy::classify`]) and served with one of:
//!
//! - cache-first with background revalidation (static assets, images)
//! - network-first with cache fallback (API calls, navigations)
//! - network-only (non-GET, collaboration/editor paths)
//!
//! Only status 200 responses are ever cached, and every partition is capped
//! with FIFO eviction.

pub mod cache;
pub mod strategy;
mod worker;

pub use cache::{CacheCaps, CacheClass, CachePartition, CacheStorage};
pub use strategy::{RequestClass, Strategy, classify};
pub use worker::ProxyHandle;

use serde::Serialize;

use crate::api::{HttpResponse, NetworkError};

/// File the proxy persists its partitions to between runs.
pub const CACHE_FILE: &str = "proxy-cache.json";

/// Worker configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyConfig {
    /// Worker version; part of every partition name
    pub version: String,

    pub caps: CacheCaps,

    /// Path prefixes that are never cached
    pub passthrough: Vec<String>,

    /// Static asset URLs fetched on install
    pub precache: Vec<String>,

    /// Document served to navigations when both network and cache miss
    pub offline_document: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            version: concat!("v", env!("CARGO_PKG_VERSION")).to_string(),
            caps: CacheCaps::default(),
            passthrough: vec!["/collab".to_string(), "/editor".to_string()],
            precache: Vec::new(),
            offline_document: None,
        }
    }
}

/// Errors surfaced by the proxy.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("precache failed: {0}")]
    InstallFailed(String),

    #[error("worker is not installed")]
    NotInstalled,

    #[error("proxy worker has stopped")]
    Closed,
}

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Started, not yet installed; fetches are not intercepted
    Parsed,
    /// Precache done, waiting to take over
    Installed,
    /// Intercepting fetches
    Active,
}

/// Where a proxied response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    Cache,
    Network,
    /// The configured offline document, served to a failed navigation
    OfflineFallback,
}

impl ResponseSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseSource::Cache => "cache",
            ResponseSource::Network => "network",
            ResponseSource::OfflineFallback => "offline_fallback",
        }
    }
}

/// A response plus how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyResponse {
    pub response: HttpResponse,
    pub source: ResponseSource,
    pub class: RequestClass,
}

/// Lifecycle notifications broadcast by the worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProxyEvent {
    /// Install finished. `update_ready` is set when partitions from another
    /// version are still present, i.e. this worker replaces an older one.
    Installed { version: String, update_ready: bool },
    Activated { version: String, purged: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionStats {
    pub name: String,
    pub entries: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cap: Option<usize>,
}

/// Snapshot of the worker and its partitions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub version: String,
    pub state: WorkerState,
    pub partitions: Vec<PartitionStats>,
}

impl CacheStats {
    /// Entries in the partition of `class` for the current version.
    pub fn entries(&self, class: CacheClass) -> usize {
        let name = class.partition_name(&self.version);
        self.partitions
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.entries)
            .unwrap_or(0)
    }
}
