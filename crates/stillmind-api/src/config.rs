use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use stillmind_core::util::is_http_url;
use thiserror::Error;

const MIN_JWT_SECRET_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_path: PathBuf,
    pub jwt_secret: String,
    pub jwt_ttl: Duration,
    pub magic_link_ttl: Duration,
    pub frontend_url: String,
    pub rate_limit_window: Duration,
    pub auth_rate_limit_per_window: u32,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("database_path", &self.database_path)
            .field("jwt_secret", &"[REDACTED]")
            .field("jwt_ttl", &self.jwt_ttl)
            .field("magic_link_ttl", &self.magic_link_ttl)
            .field("frontend_url", &self.frontend_url)
            .field("rate_limit_window", &self.rate_limit_window)
            .field(
                "auth_rate_limit_per_window",
                &self.auth_rate_limit_per_window,
            )
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "STILLMIND_API_BIND_ADDR", "127.0.0.1:3000");
        let database_path = PathBuf::from(value_or_default(
            &lookup,
            "DATABASE_PATH",
            "data/stillmind.db",
        ));

        let jwt_secret = required_trimmed(&lookup, "JWT_SECRET")?;
        if jwt_secret.len() < MIN_JWT_SECRET_LEN {
            return Err(ConfigError::Invalid(format!(
                "JWT_SECRET must be at least {MIN_JWT_SECRET_LEN} characters"
            )));
        }

        let jwt_ttl_secs = bounded_u64(&lookup, "JWT_TTL_SECS", 2_592_000, 300, 7_776_000)?;
        let magic_link_ttl_secs = bounded_u64(&lookup, "MAGIC_LINK_TTL_SECS", 900, 60, 3_600)?;

        let frontend_url = value_or_default(&lookup, "FRONTEND_URL", "http://localhost:8080");
        if !is_http_url(&frontend_url) {
            return Err(ConfigError::Invalid(
                "FRONTEND_URL must start with http:// or https://".to_string(),
            ));
        }
        let frontend_url = trim_trailing(&frontend_url).to_string();

        let rate_limit_window_secs =
            bounded_u64(&lookup, "AUTH_RATE_LIMIT_WINDOW_SECS", 900, 10, 3_600)?;
        let auth_rate_limit_per_window =
            value_or_default(&lookup, "AUTH_RATE_LIMIT_PER_WINDOW", "5")
                .parse::<u32>()
                .map_err(|_| {
                    ConfigError::Invalid(
                        "AUTH_RATE_LIMIT_PER_WINDOW must be an integer in [1, 1000]".to_string(),
                    )
                })?;
        if !(1..=1_000).contains(&auth_rate_limit_per_window) {
            return Err(ConfigError::Invalid(
                "AUTH_RATE_LIMIT_PER_WINDOW must be in [1, 1000]".to_string(),
            ));
        }

        Ok(Self {
            bind_addr,
            database_path,
            jwt_secret,
            jwt_ttl: Duration::from_secs(jwt_ttl_secs),
            magic_link_ttl: Duration::from_secs(magic_link_ttl_secs),
            frontend_url,
            rate_limit_window: Duration::from_secs(rate_limit_window_secs),
            auth_rate_limit_per_window,
        })
    }
}

fn bounded_u64(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64, ConfigError> {
    let value = match optional_trimmed(lookup, name) {
        Some(raw) => raw.parse::<u64>().map_err(|_| {
            ConfigError::Invalid(format!("{name} must be an integer in [{min}, {max}]"))
        })?,
        None => default,
    };
    if !(min..=max).contains(&value) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be in [{min}, {max}]"
        )));
    }
    Ok(value)
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn trim_trailing(value: &str) -> &str {
    value.trim_end_matches('/')
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use pretty_assertions::assert_eq;

    const SECRET: &str = "0123456789abcdef0123456789abcdef-secret";

    fn config_from(map: &HashMap<&str, &str>) -> Result<AppConfig, ConfigError> {
        AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn config_requires_jwt_secret() {
        let err = config_from(&HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("JWT_SECRET"));

        let short = HashMap::from([("JWT_SECRET", "too-short")]);
        assert!(config_from(&short).is_err());
    }

    #[test]
    fn config_applies_defaults() {
        let config = config_from(&HashMap::from([("JWT_SECRET", SECRET)])).unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1:3000");
        assert_eq!(config.database_path, PathBuf::from("data/stillmind.db"));
        assert_eq!(config.jwt_ttl, Duration::from_secs(30 * 24 * 60 * 60));
        assert_eq!(config.magic_link_ttl, Duration::from_secs(900));
        assert_eq!(config.frontend_url, "http://localhost:8080");
        assert_eq!(config.auth_rate_limit_per_window, 5);
    }

    #[test]
    fn config_rejects_out_of_range_values() {
        let map = HashMap::from([("JWT_SECRET", SECRET), ("MAGIC_LINK_TTL_SECS", "5")]);
        assert!(config_from(&map).is_err());

        let map = HashMap::from([("JWT_SECRET", SECRET), ("FRONTEND_URL", "ftp://host")]);
        assert!(config_from(&map).is_err());
    }

    #[test]
    fn config_redacts_sensitive_debug_fields() {
        let config = config_from(&HashMap::from([("JWT_SECRET", SECRET)])).unwrap();

        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains(SECRET));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
