//! Runtime configuration.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable naming a JSON config file.
pub const CONFIG_PATH_ENV: &str = "AGENT_RELAY_CONFIG";
/// Environment override for [`RelayConfig::listen_addr`].
pub const LISTEN_ADDR_ENV: &str = "AGENT_RELAY_LISTEN_ADDR";
/// Environment override for [`RelayConfig::request_timeout_ms`].
pub const REQUEST_TIMEOUT_ENV: &str = "AGENT_RELAY_REQUEST_TIMEOUT_MS";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Relay settings. Every field has a default, so an empty JSON object is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Deadline for request/response exchanges.
    pub request_timeout_ms: u64,
    /// Executions idle longer than this are evicted from client caches.
    pub max_execution_age_secs: u64,
    /// Upper bound on executions cached per client.
    pub max_executions: usize,
    /// Period of the background eviction sweep.
    pub sweep_interval_secs: u64,
    /// Address the demo server binds.
    pub listen_addr: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            max_execution_age_secs: 30 * 60,
            max_executions: 20,
            sweep_interval_secs: 60,
            listen_addr: "127.0.0.1:3000".to_string(),
        }
    }
}

impl RelayConfig {
    /// Load from the file named by `AGENT_RELAY_CONFIG` (if set), then apply
    /// environment overrides.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed, or an override is invalid.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse a JSON config file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(addr) = lookup(LISTEN_ADDR_ENV) {
            self.listen_addr = addr;
        }
        if let Some(raw) = lookup(REQUEST_TIMEOUT_ENV) {
            self.request_timeout_ms = raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: REQUEST_TIMEOUT_ENV,
                value: raw.clone(),
            })?;
        }
        Ok(())
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub const fn max_execution_age(&self) -> Duration {
        Duration::from_secs(self.max_execution_age_secs)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}
