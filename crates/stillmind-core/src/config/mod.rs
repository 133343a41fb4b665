//! Client configuration.
//!
//! `ClientConfig` tells a device where the remote entry service lives and how
//! often to sync. Values come from `STILLMIND_*` environment variables; every
//! field has a default so an unconfigured build runs local-only against a
//! development server.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::util::{is_http_url, normalize_text_option};

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:3000";
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Runtime settings for the sync client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Base URL of the remote entry service, without trailing slash
    pub api_url: String,
    /// Whether the scheduler may run at all
    pub sync_enabled: bool,
    pub sync_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Upper bound on every HTTP request
    pub http_timeout: Duration,
    /// Local database file; `None` keeps entries in memory
    pub db_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            sync_enabled: true,
            sync_interval: Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            db_path: None,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = std::env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_url = optional(&lookup, "STILLMIND_API_URL")
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        if !is_http_url(&api_url) {
            return Err(ConfigError::Invalid(
                "STILLMIND_API_URL must start with http:// or https://".to_string(),
            ));
        }

        let sync_enabled = match optional(&lookup, "STILLMIND_SYNC_ENABLED") {
            None => true,
            Some(value) => parse_bool(&value).ok_or_else(|| {
                ConfigError::Invalid("STILLMIND_SYNC_ENABLED must be true or false".to_string())
            })?,
        };

        let sync_interval_secs = secs_in_range(
            &lookup,
            "STILLMIND_SYNC_INTERVAL_SECS",
            DEFAULT_SYNC_INTERVAL_SECS,
            5..=3_600,
        )?;
        let heartbeat_interval_secs = secs_in_range(
            &lookup,
            "STILLMIND_HEARTBEAT_INTERVAL_SECS",
            DEFAULT_HEARTBEAT_INTERVAL_SECS,
            5..=3_600,
        )?;
        let http_timeout_secs = secs_in_range(
            &lookup,
            "STILLMIND_HTTP_TIMEOUT_SECS",
            DEFAULT_HTTP_TIMEOUT_SECS,
            1..=300,
        )?;

        let db_path = optional(&lookup, "STILLMIND_DB_PATH").map(PathBuf::from);

        Ok(Self {
            api_url,
            sync_enabled,
            sync_interval: Duration::from_secs(sync_interval_secs),
            heartbeat_interval: Duration::from_secs(heartbeat_interval_secs),
            http_timeout: Duration::from_secs(http_timeout_secs),
            db_path,
        })
    }

    /// Build the shared HTTP client honoring the configured timeout
    pub fn http_client(&self) -> crate::Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .timeout(self.http_timeout)
            .build()?)
    }
}

fn optional(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    normalize_text_option(lookup(name))
}

fn secs_in_range(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    range: std::ops::RangeInclusive<u64>,
) -> Result<u64, ConfigError> {
    let Some(raw) = optional(lookup, name) else {
        return Ok(default);
    };
    let invalid = || {
        ConfigError::Invalid(format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        ))
    };
    let value = raw.parse::<u64>().map_err(|_| invalid())?;
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(invalid())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
