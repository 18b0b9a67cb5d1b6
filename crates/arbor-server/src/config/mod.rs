//! Server configuration.
//!
//! The server file wraps a [`DatabaseConfig`] under `[database]` and adds
//! the listener settings. Every key is optional.
//!
//! ```toml
//! host = "127.0.0.1"
//! port = 8088
//! pool_name = "arbor"
//! modules = ["/etc/arbor/modules/util.xqm"]
//!
//! [database.pool]
//! min_brokers = 1
//! max_brokers = 20
//! shutdown_grace_ms = 1000
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use arbor_common::config::DatabaseConfig;
use arbor_common::constants::DEFAULT_POOL_NAME;
use serde::{Deserialize, Serialize};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8088;
const DEFAULT_CONNECTION_LIMIT: usize = 64;
const DEFAULT_QUERY_TIMEOUT_MS: u64 = 30_000;

/// Settings of the `arbord` process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub host: String,
    /// Listen port; 0 picks a free one.
    pub port: u16,
    /// Name of the broker pool the server configures.
    pub pool_name: String,
    /// Client connections served at once. Extra ones are refused.
    pub max_connections: usize,
    /// Per-query time limit in milliseconds (0 = no limit).
    pub query_timeout_ms: u64,
    /// Library modules registered at startup.
    pub modules: Vec<PathBuf>,
    /// Handed to the broker pool.
    pub database: DatabaseConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            pool_name: DEFAULT_POOL_NAME.to_string(),
            max_connections: DEFAULT_CONNECTION_LIMIT,
            query_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
            modules: Vec::new(),
            database: DatabaseConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Reads a TOML file. Keys left out take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Writes the configuration as TOML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        fs::write(path, self.to_toml()?)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize server configuration")
    }

    /// Returns `host:port`.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns the query time limit, if any.
    pub fn query_timeout(&self) -> Option<Duration> {
        (self.query_timeout_ms > 0).then(|| Duration::from_millis(self.query_timeout_ms))
    }

    /// Checks the settings the server itself uses, then the database part.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.pool_name.trim().is_empty(), "pool_name cannot be empty");
        ensure!(self.max_connections > 0, "max_connections must be at least 1");
        ensure!(
            self.database.storage.is_memory(),
            "storage.data_dir is not supported: arbord keeps documents in memory"
        );
        self.database
            .validate()
            .context("invalid database configuration")
    }

    /// Starts from the defaults and overrides selected settings.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Overrides [`ServerConfig`] defaults one setting at a time.
#[derive(Debug, Clone)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Listen address.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Listen port.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Pool name.
    pub fn pool_name(mut self, name: impl Into<String>) -> Self {
        self.config.pool_name = name.into();
        self
    }

    /// Broker bounds of the pool.
    pub fn brokers(mut self, min: usize, max: usize) -> Self {
        let pool = &mut self.config.database.pool;
        pool.min_brokers = min;
        pool.max_brokers = max;
        self
    }

    /// How long shutdown waits for active brokers.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.database.pool.shutdown_grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Connection limit.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Adds a library module to register at startup.
    pub fn module(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.modules.push(path.into());
        self
    }

    /// Finishes the configuration. Validation is left to the caller.
    pub fn build(self) -> ServerConfig {
        self.config
    }
}
