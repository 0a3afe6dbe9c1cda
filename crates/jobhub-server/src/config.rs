//! Hub server configuration.
//!
//! Loaded from an optional TOML file; command-line flags override the file.
//!
//! ```toml
//! http_bind_addr = "0.0.0.0:8080"
//! redis_url = "redis://127.0.0.1/"
//!
//! [broker]
//! max_scan = 200
//!
//! [router]
//! routingTimeoutMs = 2000
//! enableBatching = true
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use jobhub_broker::BrokerConfig;
use jobhub_router::RouterConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP API bind address.
    pub http_bind_addr: String,

    /// Redis connection URL. The in-memory store is used when absent.
    pub redis_url: Option<String>,

    /// Key prefix for the Redis store.
    pub redis_prefix: String,

    /// Heartbeat timeout before a worker is marked offline (seconds).
    pub heartbeat_timeout_secs: u64,

    /// Interval of the worker reaper and orphan requeue pass (seconds).
    pub maintenance_interval_secs: u64,

    /// Interval of the dead-letter cleanup pass (seconds).
    pub dead_letter_cleanup_secs: u64,

    /// Capacity of each connection's outbound buffer.
    pub connection_buffer: usize,

    pub broker: BrokerConfig,
    pub router: RouterConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_bind_addr: "127.0.0.1:8080".to_string(),
            redis_url: None,
            redis_prefix: "jobhub".to_string(),
            heartbeat_timeout_secs: 45,
            maintenance_interval_secs: 15,
            dead_letter_cleanup_secs: 3600,
            connection_buffer: 256,
            broker: BrokerConfig::default(),
            router: RouterConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from a TOML file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml(&text).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.default_priority > self.broker.max_priority {
            return Err(ConfigError::Invalid(format!(
                "broker.default_priority {} exceeds broker.max_priority {}",
                self.broker.default_priority, self.broker.max_priority
            )));
        }
        if self.router.max_queue_size == 0 {
            return Err(ConfigError::Invalid(
                "router.maxQueueSize must be at least 1".to_string(),
            ));
        }
        if self.connection_buffer == 0 {
            return Err(ConfigError::Invalid(
                "connection_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }

    pub fn dead_letter_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.dead_letter_cleanup_secs.max(1))
    }
}
