//! Named cache partitions with FIFO eviction.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::HttpResponse;

/// The three partition classes the proxy maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheClass {
    Static,
    Runtime,
    Images,
}

impl CacheClass {
    pub const ALL: [CacheClass; 3] = [CacheClass::Static, CacheClass::Runtime, CacheClass::Images];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheClass::Static => "static",
            CacheClass::Runtime => "runtime",
            CacheClass::Images => "images",
        }
    }

    /// Partition name for this class under a worker version.
    pub fn partition_name(&self, version: &str) -> String {
        format!("taskdeck-{}-{}", self.as_str(), version)
    }
}

/// Item caps per partition class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheCaps {
    pub static_assets: usize,
    pub runtime: usize,
    pub images: usize,
}

impl Default for CacheCaps {
    fn default() -> Self {
        Self {
            static_assets: 200,
            runtime: 100,
            images: 50,
        }
    }
}

impl CacheCaps {
    pub fn for_class(&self, class: CacheClass) -> usize {
        match class {
            CacheClass::Static => self.static_assets,
            CacheClass::Runtime => self.runtime,
            CacheClass::Images => self.images,
        }
    }
}

/// One cache partition. Entries are kept in insertion order and the oldest
/// are evicted first once the cap is exceeded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CachePartition {
    entries: VecDeque<(String, HttpResponse)>,
}

impl CachePartition {
    pub fn get(&self, key: &str) -> Option<&HttpResponse> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, response)| response)
    }

    /// Insert `response` under `key`, then evict from the front until at most
    /// `cap` entries remain. Returns the evicted keys.
    ///
    /// Replacing an existing key counts as a fresh insert.
    pub fn put(&mut self, key: String, response: HttpResponse, cap: usize) -> Vec<String> {
        self.entries.retain(|(k, _)| *k != key);
        self.entries.push_back((key, response));

        let mut evicted = Vec::new();
        while self.entries.len() > cap {
            match self.entries.pop_front() {
                Some((k, _)) => evicted.push(k),
                None => break,
            }
        }
        evicted
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| k != key);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys from oldest to newest.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }
}

/// All partitions owned by the proxy, keyed by partition name.
///
/// Outlives any single worker version: a new worker is started over the
/// previous worker's storage and purges stale partitions on activation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStorage {
    partitions: BTreeMap<String, CachePartition>,
}

impl CacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load persisted partitions. A missing or unreadable file yields an
    /// empty storage.
    pub fn load(path: &Path) -> Self {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                debug!(path = %path.display(), error = %e, "discarding unreadable cache file");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec(self)?;
        fs::write(path, bytes)
    }

    pub fn open(&mut self, name: &str) -> &mut CachePartition {
        self.partitions.entry(name.to_string()).or_default()
    }

    pub fn get(&self, name: &str) -> Option<&CachePartition> {
        self.partitions.get(name)
    }

    /// Look a key up in one partition.
    pub fn lookup(&self, name: &str, key: &str) -> Option<&HttpResponse> {
        self.partitions.get(name).and_then(|p| p.get(key))
    }

    pub fn delete(&mut self, name: &str) -> bool {
        self.partitions.remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.partitions.keys().cloned().collect()
    }

    /// Delete every partition whose name is not in `keep`. Returns the
    /// deleted names.
    pub fn retain_only(&mut self, keep: &[String]) -> Vec<String> {
        let stale: Vec<String> = self
            .partitions
            .keys()
            .filter(|name| !keep.contains(name))
            .cloned()
            .collect();
        for name in &stale {
            self.partitions.remove(name);
        }
        stale
    }

    pub fn clear(&mut self) {
        self.partitions.clear();
    }
}
