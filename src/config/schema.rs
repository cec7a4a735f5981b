//! KDL schema for config.kdl.
//!
//! This module provides:
//! - Rust structs representing the KDL schema
//! - Parsing from and rendering to KDL
//! - Validation
//! - Reading and writing config files

use std::fs;
use std::path::Path;

use kdl::{KdlDocument, KdlEntry, KdlNode, KdlValue};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Output format preference for CLI commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// JSON output (default, machine-readable)
    #[default]
    Json,
    /// Human-readable output
    Human,
}

impl OutputFormat {
    /// Parse from string, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "json" => Some(OutputFormat::Json),
            "human" => Some(OutputFormat::Human),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Human => "human",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// `cache { ... }` block: per-partition item caps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub static_assets: Option<usize>,
    pub runtime: Option<usize>,
    pub images: Option<usize>,
}

impl CacheConfig {
    fn is_empty(&self) -> bool {
        self.static_assets.is_none() && self.runtime.is_none() && self.images.is_none()
    }
}

/// Settings stored in config.kdl.
///
/// # KDL Schema
///
/// ```kdl
/// api-url "https://tasks.example.com/api/mobile.php"
/// request-timeout-secs 10
/// page-size 200
/// max-attempts 5
/// drain-interval-secs 300
/// full-sync-after-hours 24
/// output-format "human"  // or "json"
/// cache {
///     static 200
///     runtime 100
///     images 50
/// }
/// passthrough "/collab" "/editor"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskdeckConfig {
    /// Task API endpoint
    pub api_url: Option<String>,

    pub request_timeout_secs: Option<u64>,

    /// Tasks per page on a full sync
    pub page_size: Option<u32>,

    /// Delivery attempts before a queued action is set aside
    pub max_attempts: Option<u32>,

    /// Periodic queue drain in `td watch`
    pub drain_interval_secs: Option<u64>,

    /// Age of the last sync after which a full reload is done
    pub full_sync_after_hours: Option<i64>,

    pub output_format: Option<OutputFormat>,

    pub cache: CacheConfig,

    /// Path prefixes the proxy never caches
    pub passthrough: Option<Vec<String>>,
}

fn string_arg(doc: &KdlDocument, name: &str) -> Option<String> {
    doc.get(name)?
        .entries()
        .first()?
        .value()
        .as_string()
        .map(str::to_string)
}

fn int_arg(doc: &KdlDocument, name: &str) -> Option<i128> {
    doc.get(name)?.entries().first()?.value().as_integer()
}

fn positive<T: TryFrom<i128>>(value: Option<i128>) -> Option<T> {
    value.filter(|v| *v > 0).and_then(|v| T::try_from(v).ok())
}

fn push_string(doc: &mut KdlDocument, name: &str, value: &str) {
    let mut node = KdlNode::new(name);
    node.push(KdlEntry::new(KdlValue::String(value.to_string())));
    doc.nodes_mut().push(node);
}

fn push_int(doc: &mut KdlDocument, name: &str, value: i128) {
    let mut node = KdlNode::new(name);
    node.push(KdlEntry::new(KdlValue::Integer(value)));
    doc.nodes_mut().push(node);
}

impl TaskdeckConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the config values.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if let Some(ref url) = self.api_url {
            if reqwest::Url::parse(url).is_err() {
                return Err(format!("api-url is not a valid URL: {}", url));
            }
        }
        if self.page_size == Some(0) {
            return Err("page-size must be at least 1".to_string());
        }
        if self.max_attempts == Some(0) {
            return Err("max-attempts must be at least 1".to_string());
        }
        if self.request_timeout_secs == Some(0) || self.drain_interval_secs == Some(0) {
            return Err("timeouts and intervals must be at least 1 second".to_string());
        }
        if matches!(self.full_sync_after_hours, Some(h) if h <= 0) {
            return Err("full-sync-after-hours must be at least 1".to_string());
        }
        if let Some(ref prefixes) = self.passthrough {
            if let Some(bad) = prefixes.iter().find(|p| !p.starts_with('/')) {
                return Err(format!("passthrough prefixes must start with '/': {}", bad));
            }
        }
        Ok(())
    }

    /// Parse config from a KDL document. Unknown nodes and out-of-range
    /// values are ignored.
    pub fn from_kdl(doc: &KdlDocument) -> Self {
        let mut config = Self::new();

        config.api_url = string_arg(doc, "api-url");
        config.request_timeout_secs = positive(int_arg(doc, "request-timeout-secs"));
        config.page_size = positive(int_arg(doc, "page-size"));
        config.max_attempts = positive(int_arg(doc, "max-attempts"));
        config.drain_interval_secs = positive(int_arg(doc, "drain-interval-secs"));
        config.full_sync_after_hours = positive(int_arg(doc, "full-sync-after-hours"));
        config.output_format = string_arg(doc, "output-format").and_then(|s| OutputFormat::parse(&s));

        if let Some(children) = doc.get("cache").and_then(|node| node.children()) {
            config.cache.static_assets = positive(int_arg(children, "static"));
            config.cache.runtime = positive(int_arg(children, "runtime"));
            config.cache.images = positive(int_arg(children, "images"));
        }

        if let Some(node) = doc.get("passthrough") {
            let prefixes: Vec<String> = node
                .entries()
                .iter()
                .filter_map(|entry| entry.value().as_string().map(str::to_string))
                .collect();
            config.passthrough = Some(prefixes);
        }

        config
    }

    /// Convert config to a KDL document.
    pub fn to_kdl(&self) -> KdlDocument {
        let mut doc = KdlDocument::new();

        if let Some(ref url) = self.api_url {
            push_string(&mut doc, "api-url", url);
        }
        if let Some(secs) = self.request_timeout_secs {
            push_int(&mut doc, "request-timeout-secs", secs as i128);
        }
        if let Some(size) = self.page_size {
            push_int(&mut doc, "page-size", size as i128);
        }
        if let Some(attempts) = self.max_attempts {
            push_int(&mut doc, "max-attempts", attempts as i128);
        }
        if let Some(secs) = self.drain_interval_secs {
            push_int(&mut doc, "drain-interval-secs", secs as i128);
        }
        if let Some(hours) = self.full_sync_after_hours {
            push_int(&mut doc, "full-sync-after-hours", hours as i128);
        }
        if let Some(ref format) = self.output_format {
            push_string(&mut doc, "output-format", format.as_str());
        }

        if !self.cache.is_empty() {
            let mut children = KdlDocument::new();
            if let Some(n) = self.cache.static_assets {
                push_int(&mut children, "static", n as i128);
            }
            if let Some(n) = self.cache.runtime {
                push_int(&mut children, "runtime", n as i128);
            }
            if let Some(n) = self.cache.images {
                push_int(&mut children, "images", n as i128);
            }
            let mut node = KdlNode::new("cache");
            node.set_children(children);
            doc.nodes_mut().push(node);
        }

        if let Some(ref prefixes) = self.passthrough {
            let mut node = KdlNode::new("passthrough");
            for prefix in prefixes {
                node.push(KdlEntry::new(KdlValue::String(prefix.clone())));
            }
            doc.nodes_mut().push(node);
        }

        doc.autoformat();
        doc
    }

    /// Read a config file. A missing file is an empty config.
    pub fn read(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e.into()),
        };
        let doc: KdlDocument = text
            .parse()
            .map_err(|e| Error::InvalidInput(format!("{}: {}", path.display(), e)))?;
        Ok(Self::from_kdl(&doc))
    }

    /// Write this config as KDL, creating parent directories.
    pub fn write(&self, path: &Path) -> Result<()> {
        self.validate().map_err(Error::InvalidInput)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_kdl().to_string())?;
        Ok(())
    }
}
