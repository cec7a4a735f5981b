//! `td config` commands.

use std::path::PathBuf;

use serde::Serialize;
use serde_json::{Value, json};

use super::{Output, json as to_json_string};
use crate::config::{
    OutputFormat, Resolved, ResolvedConfig, Settings, TaskdeckConfig, ValueSource,
    session_config_path, system_config_path,
};
use crate::{Error, Result};

/// Keys accepted by `config get` and `config set`.
pub const KEYS: &[&str] = &[
    "api-url",
    "request-timeout-secs",
    "page-size",
    "max-attempts",
    "drain-interval-secs",
    "full-sync-after-hours",
    "output-format",
    "cache.static",
    "cache.runtime",
    "cache.images",
    "passthrough",
];

fn entry<T: Serialize>(resolved: &Resolved<T>) -> (Value, ValueSource) {
    (json!(resolved.value), resolved.source.clone())
}

fn lookup(config: &ResolvedConfig, key: &str) -> Option<(Value, ValueSource)> {
    let found = match key {
        "api-url" => entry(&config.api_url),
        "request-timeout-secs" => entry(&config.request_timeout_secs),
        "page-size" => entry(&config.page_size),
        "max-attempts" => entry(&config.max_attempts),
        "drain-interval-secs" => entry(&config.drain_interval_secs),
        "full-sync-after-hours" => entry(&config.full_sync_after_hours),
        "output-format" => entry(&config.output_format),
        "cache.static" => entry(&config.cache_static),
        "cache.runtime" => entry(&config.cache_runtime),
        "cache.images" => entry(&config.cache_images),
        "passthrough" => entry(&config.passthrough),
        _ => return None,
    };
    Some(found)
}

fn unknown_key(key: &str) -> Error {
    Error::InvalidInput(format!(
        "unknown config key '{}' (expected one of: {})",
        key,
        KEYS.join(", ")
    ))
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidInput(format!("{} expects a positive number, got '{}'", key, value)))
}

/// Apply `key = value` to a config layer.
pub fn apply_setting(config: &mut TaskdeckConfig, key: &str, value: &str) -> Result<()> {
    match key {
        "api-url" => config.api_url = Some(value.trim().to_string()),
        "request-timeout-secs" => config.request_timeout_secs = Some(parse_number(key, value)?),
        "page-size" => config.page_size = Some(parse_number(key, value)?),
        "max-attempts" => config.max_attempts = Some(parse_number(key, value)?),
        "drain-interval-secs" => config.drain_interval_secs = Some(parse_number(key, value)?),
        "full-sync-after-hours" => config.full_sync_after_hours = Some(parse_number(key, value)?),
        "output-format" => {
            let format = OutputFormat::parse(value).ok_or_else(|| {
                Error::InvalidInput(format!("output-format must be json or human, got '{}'", value))
            })?;
            config.output_format = Some(format);
        }
        "cache.static" => config.cache.static_assets = Some(parse_number(key, value)?),
        "cache.runtime" => config.cache.runtime = Some(parse_number(key, value)?),
        "cache.images" => config.cache.images = Some(parse_number(key, value)?),
        "passthrough" => {
            let prefixes = value
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
            config.passthrough = Some(prefixes);
        }
        _ => return Err(unknown_key(key)),
    }
    config.validate().map_err(Error::InvalidInput)
}

#[derive(Serialize)]
pub struct ConfigShowResult {
    pub data_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_config: Option<PathBuf>,
    pub session_config: PathBuf,
    pub settings: ResolvedConfig,
}

impl Output for ConfigShowResult {
    fn to_json(&self) -> String {
        to_json_string(self)
    }

    fn to_human(&self) -> String {
        let mut lines = vec![format!("Data directory: {}", self.data_dir.display())];
        if let Some(ref path) = self.system_config {
            lines.push(format!("System config:  {}", path.display()));
        }
        lines.push(format!("Session config: {}", self.session_config.display()));
        lines.push(String::new());
        for key in KEYS {
            if let Some((value, source)) = lookup(&self.settings, key) {
                lines.push(format!("{:<22} = {:<40} ({})", key, value, source));
            }
        }
        lines.join("\n")
    }
}

pub fn config_show(settings: &Settings) -> ConfigShowResult {
    ConfigShowResult {
        data_dir: settings.data_dir.clone(),
        system_config: system_config_path(),
        session_config: session_config_path(&settings.data_dir),
        settings: settings.config.clone(),
    }
}

#[derive(Debug, Serialize)]
pub struct ConfigGetResult {
    pub key: String,
    pub value: Value,
    pub source: ValueSource,
}

impl Output for ConfigGetResult {
    fn to_json(&self) -> String {
        to_json_string(self)
    }

    fn to_human(&self) -> String {
        match &self.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

pub fn config_get(settings: &Settings, key: &str) -> Result<ConfigGetResult> {
    let (value, source) = lookup(&settings.config, key).ok_or_else(|| unknown_key(key))?;
    Ok(ConfigGetResult {
        key: key.to_string(),
        value,
        source,
    })
}

#[derive(Serialize)]
pub struct ConfigSetResult {
    pub key: String,
    pub value: String,
    pub path: PathBuf,
}

impl Output for ConfigSetResult {
    fn to_json(&self) -> String {
        to_json_string(self)
    }

    fn to_human(&self) -> String {
        format!("Set {} = {} in {}", self.key, self.value, self.path.display())
    }
}

/// Write `key = value` into the session config of the current data dir.
pub fn config_set(settings: &Settings, key: &str, value: &str) -> Result<ConfigSetResult> {
    let path = session_config_path(&settings.data_dir);
    let mut session = TaskdeckConfig::read(&path)?;
    apply_setting(&mut session, key, value)?;
    session.write(&path)?;
    Ok(ConfigSetResult {
        key: key.to_string(),
        value: value.to_string(),
        path,
    })
}
