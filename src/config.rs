//! Engine configuration
//!
//! Loaded from `FIELDSYNC_*` environment variables (a `.env` file is read
//! first by `run()`); anything unset keeps its default.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::sync::manager::SyncSettings;
use crate::sync::retry::RetryPolicy;

pub const ENV_API_URL: &str = "FIELDSYNC_API_URL";
pub const ENV_API_TOKEN: &str = "FIELDSYNC_API_TOKEN";
pub const ENV_DB_PATH: &str = "FIELDSYNC_DB_PATH";
pub const ENV_REQUEST_TIMEOUT_SECS: &str = "FIELDSYNC_REQUEST_TIMEOUT_SECS";
pub const ENV_CONCURRENCY: &str = "FIELDSYNC_CONCURRENCY";
pub const ENV_MAX_ATTEMPTS: &str = "FIELDSYNC_MAX_ATTEMPTS";
pub const ENV_BASE_DELAY_MS: &str = "FIELDSYNC_BASE_DELAY_MS";
pub const ENV_MAX_DELAY_MS: &str = "FIELDSYNC_MAX_DELAY_MS";
pub const ENV_DEBOUNCE_MS: &str = "FIELDSYNC_DEBOUNCE_MS";
pub const ENV_PENDING_WARN: &str = "FIELDSYNC_PENDING_WARN";
pub const ENV_PROBE_URL: &str = "FIELDSYNC_PROBE_URL";
pub const ENV_PROBE_INTERVAL_SECS: &str = "FIELDSYNC_PROBE_INTERVAL_SECS";
pub const ENV_SYNC_INTERVAL_MINUTES: &str = "FIELDSYNC_SYNC_INTERVAL_MINUTES";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub api_url: String,
    pub api_token: Option<String>,
    /// `None` picks the platform data directory
    pub db_path: Option<PathBuf>,
    pub request_timeout_secs: u64,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub debounce_ms: u64,
    /// Pending count above which enqueue logs a backpressure warning
    pub pending_warn_threshold: usize,
    /// Defaults to `api_url` when unset
    pub probe_url: Option<String>,
    pub probe_interval_secs: u64,
    /// 0 disables the periodic tick
    pub sync_interval_minutes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_token: None,
            db_path: None,
            request_timeout_secs: 15,
            concurrency: 4,
            retry: RetryPolicy::default(),
            debounce_ms: 500,
            pending_warn_threshold: 50,
            probe_url: None,
            probe_interval_secs: 10,
            sync_interval_minutes: 0,
        }
    }
}

impl EngineConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        config.api_url = get(ENV_API_URL).ok_or(ConfigError::Missing(ENV_API_URL))?;
        config.api_token = get(ENV_API_TOKEN);
        config.db_path = get(ENV_DB_PATH).map(PathBuf::from);
        config.probe_url = get(ENV_PROBE_URL);

        parse_into(&get, ENV_REQUEST_TIMEOUT_SECS, &mut config.request_timeout_secs)?;
        parse_into(&get, ENV_CONCURRENCY, &mut config.concurrency)?;
        parse_into(&get, ENV_MAX_ATTEMPTS, &mut config.retry.max_attempts)?;
        parse_into(&get, ENV_BASE_DELAY_MS, &mut config.retry.base_delay_ms)?;
        parse_into(&get, ENV_MAX_DELAY_MS, &mut config.retry.max_delay_ms)?;
        parse_into(&get, ENV_DEBOUNCE_MS, &mut config.debounce_ms)?;
        parse_into(&get, ENV_PENDING_WARN, &mut config.pending_warn_threshold)?;
        parse_into(&get, ENV_PROBE_INTERVAL_SECS, &mut config.probe_interval_secs)?;
        parse_into(&get, ENV_SYNC_INTERVAL_MINUTES, &mut config.sync_interval_minutes)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_url.trim().is_empty() {
            return Err(ConfigError::Missing(ENV_API_URL));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("request timeout must be at least 1 second".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("max attempts must be at least 1".to_string()));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "max delay ({} ms) is below base delay ({} ms)",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            )));
        }
        if self.sync_interval_minutes > 1440 {
            return Err(ConfigError::Invalid(format!(
                "sync interval must be 0-1440 minutes, got {}",
                self.sync_interval_minutes
            )));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_target(&self) -> &str {
        self.probe_url.as_deref().unwrap_or(&self.api_url)
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            concurrency: self.concurrency,
            request_timeout: self.request_timeout(),
        }
    }
}

fn parse_into<T, G>(get: &G, key: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: raw.clone() })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_apply() {
        let config = EngineConfig::from_lookup(lookup(&[(ENV_API_URL, "https://api.example.com")])).unwrap();

        assert_eq!(config.api_url, "https://api.example.com");
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.request_timeout(), Duration::from_secs(15));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.debounce(), Duration::from_millis(500));
        assert_eq!(config.sync_interval_minutes, 0);
        assert_eq!(config.probe_target(), "https://api.example.com");
    }

    #[test]
    fn test_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            (ENV_API_URL, "https://api.example.com"),
            (ENV_API_TOKEN, "secret"),
            (ENV_CONCURRENCY, "8"),
            (ENV_MAX_ATTEMPTS, "3"),
            (ENV_BASE_DELAY_MS, " 250 "),
            (ENV_PROBE_URL, "https://api.example.com/health"),
            (ENV_SYNC_INTERVAL_MINUTES, "15"),
        ]))
        .unwrap();

        assert_eq!(config.api_token.as_deref(), Some("secret"));
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 250);
        assert_eq!(config.probe_target(), "https://api.example.com/health");
        assert_eq!(config.sync_interval_minutes, 15);
    }

    #[test]
    fn test_missing_api_url() {
        assert!(matches!(
            EngineConfig::from_lookup(lookup(&[])),
            Err(ConfigError::Missing(ENV_API_URL))
        ));
    }

    #[test]
    fn test_invalid_values() {
        let result = EngineConfig::from_lookup(lookup(&[
            (ENV_API_URL, "https://api.example.com"),
            (ENV_CONCURRENCY, "many"),
        ]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { key: ENV_CONCURRENCY, .. })));

        let result = EngineConfig::from_lookup(lookup(&[
            (ENV_API_URL, "https://api.example.com"),
            (ENV_CONCURRENCY, "0"),
        ]));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
