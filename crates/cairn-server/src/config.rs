//! Server configuration.
//!
//! [`ServerConfig`] is read from a TOML file.  Every section and every key
//! is optional; anything left out falls back to its default:
//!
//! ```toml
//! [database]
//! path = "data/cairn.db"
//! in_memory = false
//!
//! [keys]
//! max_pregenerated = 32
//! max_concurrent = 4
//! idle_interval_ms = 250
//!
//! [protocol]
//! wait_queue_capacity = 64
//!
//! [log]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use cairn_vault::KeyPoolConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, ServerError};

/// Top-level server configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub database: DatabaseConfig,
    pub keys: KeysConfig,
    pub protocol: ProtocolConfig,
    pub log: LogConfig,
}

/// `[database]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file, created (with parent directories) if missing.
    pub path: PathBuf,
    /// Use a private in-memory database instead of `path`.
    pub in_memory: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/cairn.db"),
            in_memory: false,
        }
    }
}

/// `[keys]` section, sizing the key pregeneration pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    pub max_pregenerated: usize,
    pub max_concurrent: usize,
    pub idle_interval_ms: u64,
}

impl Default for KeysConfig {
    fn default() -> Self {
        let pool = KeyPoolConfig::default();
        Self {
            max_pregenerated: pool.max_pregenerated,
            max_concurrent: pool.max_concurrent,
            idle_interval_ms: u64::try_from(pool.idle_interval.as_millis()).unwrap_or(250),
        }
    }
}

impl KeysConfig {
    /// The pool configuration these settings describe.
    pub fn pool_config(&self) -> KeyPoolConfig {
        KeyPoolConfig {
            max_pregenerated: self.max_pregenerated,
            max_concurrent: self.max_concurrent,
            idle_interval: Duration::from_millis(self.idle_interval_ms),
        }
    }
}

/// `[protocol]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Bound on context requests waiting for the accept loop.
    pub wait_queue_capacity: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            wait_queue_capacity: 64,
        }
    }
}

/// `[log]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl ServerConfig {
    /// Load the configuration at `path`.
    ///
    /// A missing file yields the defaults; a file that exists but does not
    /// parse is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw).map_err(|err| match err {
            ServerError::Config(message) => {
                ServerError::Config(format!("{}: {message}", path.display()))
            }
            other => other,
        })
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| ServerError::Config(e.to_string()))
    }

    /// Use a private in-memory database.
    pub fn with_in_memory_database(mut self) -> Self {
        self.database.in_memory = true;
        self
    }

    /// Persist to the SQLite file at `path`.
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database.path = path.into();
        self.database.in_memory = false;
        self
    }

    pub fn with_key_pool(mut self, max_pregenerated: usize, max_concurrent: usize) -> Self {
        self.keys.max_pregenerated = max_pregenerated;
        self.keys.max_concurrent = max_concurrent;
        self
    }

    pub fn with_wait_queue_capacity(mut self, capacity: usize) -> Self {
        self.protocol.wait_queue_capacity = capacity;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log.level = level.into();
        self
    }
}
