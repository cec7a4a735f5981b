//! Precedence resolution for configuration.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. CLI flags (passed at runtime)
//! 2. `TD_API_URL` environment variable (API endpoint only)
//! 3. Session config.kdl (`<data-dir>/config.kdl`)
//! 4. System config.kdl (`~/.config/taskdeck/config.kdl`, or `TD_CONFIG`)
//! 5. Built-in defaults
//!
//! The data directory is keyed by the API endpoint, so the endpoint used to
//! locate it is resolved without the session layer. A session `api-url`
//! still applies to requests.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::config::{OutputFormat, TaskdeckConfig};
use crate::proxy::ProxyConfig;
use crate::proxy::cache::CacheCaps;
use crate::storage::RetryPolicy;
use crate::sync::SyncConfig;
use crate::{Error, Result};

/// Environment variable naming the API endpoint.
pub const API_URL_ENV: &str = "TD_API_URL";

/// Environment variable overriding the system config file location.
pub const CONFIG_PATH_ENV: &str = "TD_CONFIG";

pub const CONFIG_FILE: &str = "config.kdl";

pub const DEFAULT_API_URL: &str = "http://localhost:8080/api/mobile.php";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Tracks where a resolved value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueSource {
    /// Value from environment variable
    EnvVar(String),
    /// Value from session-level config
    Session,
    /// Value from system-level config
    System,
    /// Value from CLI flag
    CliFlag,
    /// Built-in default value
    Default,
}

impl std::fmt::Display for ValueSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueSource::EnvVar(name) => write!(f, "env:{}", name),
            ValueSource::Session => write!(f, "session"),
            ValueSource::System => write!(f, "system"),
            ValueSource::CliFlag => write!(f, "cli"),
            ValueSource::Default => write!(f, "default"),
        }
    }
}

impl Serialize for ValueSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A resolved value with its source.
#[derive(Debug, Clone, Serialize)]
pub struct Resolved<T> {
    /// The resolved value
    pub value: T,
    /// Where the value came from
    pub source: ValueSource,
}

impl<T> Resolved<T> {
    /// Create a new resolved value.
    pub fn new(value: T, source: ValueSource) -> Self {
        Self { value, source }
    }
}

/// Pick the first layer that has a value, falling back to `default`.
fn layered<T: Clone>(
    session: Option<&T>,
    system: Option<&T>,
    default: T,
) -> Resolved<T> {
    if let Some(value) = session {
        Resolved::new(value.clone(), ValueSource::Session)
    } else if let Some(value) = system {
        Resolved::new(value.clone(), ValueSource::System)
    } else {
        Resolved::new(default, ValueSource::Default)
    }
}

/// Overrides that can be passed from CLI flags.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub api_url: Option<String>,
    pub output_format: Option<OutputFormat>,
}

impl ConfigOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = Some(api_url.into());
        self
    }

    pub fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = Some(format);
        self
    }
}

/// Fully resolved configuration with source tracking.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    pub api_url: Resolved<String>,
    pub request_timeout_secs: Resolved<u64>,
    pub page_size: Resolved<u32>,
    pub max_attempts: Resolved<u32>,
    pub drain_interval_secs: Resolved<u64>,
    pub full_sync_after_hours: Resolved<i64>,
    pub output_format: Resolved<OutputFormat>,
    pub cache_static: Resolved<usize>,
    pub cache_runtime: Resolved<usize>,
    pub cache_images: Resolved<usize>,
    pub passthrough: Resolved<Vec<String>>,
}

impl ResolvedConfig {
    /// Resolve every setting from the given layers.
    pub fn resolve(
        system: &TaskdeckConfig,
        session: &TaskdeckConfig,
        env_api_url: Option<String>,
        overrides: &ConfigOverrides,
    ) -> Self {
        let sync_defaults = SyncConfig::default();
        let proxy_defaults = ProxyConfig::default();

        let api_url = if let Some(ref url) = overrides.api_url {
            Resolved::new(url.clone(), ValueSource::CliFlag)
        } else if let Some(url) = env_api_url.filter(|u| !u.is_empty()) {
            Resolved::new(url, ValueSource::EnvVar(API_URL_ENV.to_string()))
        } else {
            layered(
                session.api_url.as_ref(),
                system.api_url.as_ref(),
                DEFAULT_API_URL.to_string(),
            )
        };

        let output_format = if let Some(ref format) = overrides.output_format {
            Resolved::new(format.clone(), ValueSource::CliFlag)
        } else {
            layered(
                session.output_format.as_ref(),
                system.output_format.as_ref(),
                OutputFormat::default(),
            )
        };

        Self {
            api_url,
            request_timeout_secs: layered(
                session.request_timeout_secs.as_ref(),
                system.request_timeout_secs.as_ref(),
                DEFAULT_REQUEST_TIMEOUT_SECS,
            ),
            page_size: layered(
                session.page_size.as_ref(),
                system.page_size.as_ref(),
                sync_defaults.page_size,
            ),
            max_attempts: layered(
                session.max_attempts.as_ref(),
                system.max_attempts.as_ref(),
                sync_defaults.retry.max_attempts,
            ),
            drain_interval_secs: layered(
                session.drain_interval_secs.as_ref(),
                system.drain_interval_secs.as_ref(),
                sync_defaults.drain_interval.as_secs(),
            ),
            full_sync_after_hours: layered(
                session.full_sync_after_hours.as_ref(),
                system.full_sync_after_hours.as_ref(),
                sync_defaults.full_sync_after.num_hours(),
            ),
            output_format,
            cache_static: layered(
                session.cache.static_assets.as_ref(),
                system.cache.static_assets.as_ref(),
                proxy_defaults.caps.static_assets,
            ),
            cache_runtime: layered(
                session.cache.runtime.as_ref(),
                system.cache.runtime.as_ref(),
                proxy_defaults.caps.runtime,
            ),
            cache_images: layered(
                session.cache.images.as_ref(),
                system.cache.images.as_ref(),
                proxy_defaults.caps.images,
            ),
            passthrough: layered(
                session.passthrough.as_ref(),
                system.passthrough.as_ref(),
                proxy_defaults.passthrough,
            ),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.value)
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            page_size: self.page_size.value,
            drain_interval: Duration::from_secs(self.drain_interval_secs.value),
            full_sync_after: chrono::Duration::hours(self.full_sync_after_hours.value),
            retry: RetryPolicy {
                max_attempts: self.max_attempts.value,
            },
        }
    }

    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            caps: CacheCaps {
                static_assets: self.cache_static.value,
                runtime: self.cache_runtime.value,
                images: self.cache_images.value,
            },
            passthrough: self.passthrough.value.clone(),
            ..ProxyConfig::default()
        }
    }
}

/// Location of the system config file.
pub fn system_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    dirs::config_dir().map(|dir| dir.join("taskdeck").join(CONFIG_FILE))
}

/// Location of the session config file inside a data directory.
pub fn session_config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE)
}

/// Configuration together with the data directory it was resolved for.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub config: ResolvedConfig,
}

/// Resolve configuration from disk, the environment, and CLI overrides.
pub fn resolve_config(overrides: &ConfigOverrides) -> Result<Settings> {
    let system = match system_config_path() {
        Some(path) => TaskdeckConfig::read(&path)?,
        None => TaskdeckConfig::new(),
    };
    let env_api_url = std::env::var(API_URL_ENV).ok();

    // The session layer lives in the data dir, which is keyed by endpoint.
    let locating = ResolvedConfig::resolve(
        &system,
        &TaskdeckConfig::new(),
        env_api_url.clone(),
        overrides,
    );
    let data_dir = crate::storage::get_storage_dir(&locating.api_url.value)?;
    let session = TaskdeckConfig::read(&session_config_path(&data_dir))?;

    if let Err(e) = system.validate().and_then(|_| session.validate()) {
        return Err(Error::InvalidInput(format!("invalid config: {}", e)));
    }

    let config = ResolvedConfig::resolve(&system, &session, env_api_url, overrides);
    Ok(Settings { data_dir, config })
}
