//! Configuration
//!
//! Defaults are tuned for in-process use; a TOML file and a few
//! environment variables override them for deployed brokers and
//! workers. Environment always wins over the file.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name given to the lazily created default book
    pub default_book_name: String,

    /// Queue pacing
    pub queue: QueueConfig,

    /// Broker endpoint
    pub broker: BrokerConfig,
}

/// Queue pacing configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Idle-poll interval of the in-process drain loop, in milliseconds
    pub local_poll_interval_ms: u64,

    /// Idle-poll interval of distributed workers, in milliseconds
    pub worker_poll_interval_ms: u64,
}

/// Broker endpoint configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Address the broker binds
    pub listen_addr: String,

    /// Address clients and workers connect to
    pub url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_book_name: "default_book".to_string(),
            queue: QueueConfig::default(),
            broker: BrokerConfig::default(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            local_poll_interval_ms: 10,
            worker_poll_interval_ms: 100,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7410".to_string(),
            url: "127.0.0.1:7410".to_string(),
        }
    }
}

impl Config {
    /// Parse a TOML config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&raw).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load from `LEDGER_CONFIG` (if set) and apply environment
    /// overrides
    ///
    /// `LEDGER_BROKER_LISTEN` and `LEDGER_BROKER_URL` override the
    /// broker endpoints.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("LEDGER_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        if let Ok(listen) = std::env::var("LEDGER_BROKER_LISTEN") {
            config.broker.listen_addr = listen;
        }
        if let Ok(url) = std::env::var("LEDGER_BROKER_URL") {
            config.broker.url = url;
        }
        Ok(config)
    }

    /// In-process drain loop idle interval
    pub fn local_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue.local_poll_interval_ms)
    }

    /// Distributed worker idle interval
    pub fn worker_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue.worker_poll_interval_ms)
    }
}
