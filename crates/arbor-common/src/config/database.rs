//! Database configuration structures.
//!
//! These structures define all configurable aspects of an Arbor instance.
//! They are loaded from TOML by the server and handed to the broker pool,
//! which treats the storage part as opaque beyond validation.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::constants::{
    DEFAULT_ACQUIRE_TIMEOUT_MS, DEFAULT_MAX_BROKERS, DEFAULT_MAX_CACHED_QUERIES,
    DEFAULT_MAX_PLAN_COPIES, DEFAULT_MIN_BROKERS, DEFAULT_PAGE_SIZE, DEFAULT_SHUTDOWN_GRACE_MS,
    MIN_PAGE_SIZE,
};
use crate::types::QName;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value failed validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// The configuration file could not be read or written.
    #[error("configuration I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid TOML for this structure.
    #[error("configuration parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration could not be rendered as TOML.
    #[error("configuration serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Main database configuration.
///
/// # Example
///
/// ```rust
/// use arbor_common::config::DatabaseConfig;
///
/// let config = DatabaseConfig::default();
/// assert_eq!(config.pool.min_brokers, 1);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Broker pool sizing and timeouts.
    pub pool: PoolSettings,

    /// Storage configuration.
    pub storage: StorageConfig,

    /// Full-text index configuration.
    pub index: IndexConfig,

    /// Query plan cache configuration.
    pub query: QueryConfig,
}

impl DatabaseConfig {
    /// Creates a small in-memory configuration for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            pool: PoolSettings {
                min_brokers: 1,
                max_brokers: 5,
                acquire_timeout_ms: 1_000,
                shutdown_grace_ms: 500,
            },
            ..Default::default()
        }
    }

    /// Loads a configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses a configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validates the whole configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;
        self.storage.validate()?;
        self.query.validate()?;
        Ok(())
    }
}

/// Broker pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Brokers created eagerly when the pool is configured.
    pub min_brokers: usize,

    /// Upper bound on brokers in existence (free plus checked out).
    pub max_brokers: usize,

    /// Default acquire timeout in milliseconds.
    pub acquire_timeout_ms: u64,

    /// How long shutdown waits for active brokers before forcing teardown.
    pub shutdown_grace_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_brokers: DEFAULT_MIN_BROKERS,
            max_brokers: DEFAULT_MAX_BROKERS,
            acquire_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

impl PoolSettings {
    /// Returns the acquire timeout.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Returns the shutdown grace period.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Checks the `(min, max)` bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_brokers < 1 {
            return Err(ConfigError::Invalid(
                "min_brokers must be at least 1".to_string(),
            ));
        }
        if self.max_brokers < self.min_brokers {
            return Err(ConfigError::Invalid(format!(
                "max_brokers ({}) cannot be less than min_brokers ({})",
                self.max_brokers, self.min_brokers
            )));
        }
        Ok(())
    }
}

/// Storage configuration.
///
/// The broker pool does not interpret these values; it only refuses to
/// start on a configuration that fails validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory. `None` keeps everything in memory. Only a pool
    /// configured over a caller-supplied store may set it.
    pub data_dir: Option<PathBuf>,

    /// Page size in bytes. Must be a power of 2.
    pub page_size: usize,

    /// Open the database read-only.
    pub read_only: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            page_size: DEFAULT_PAGE_SIZE,
            read_only: false,
        }
    }
}

impl StorageConfig {
    /// Returns true when no data directory is configured.
    pub fn is_memory(&self) -> bool {
        self.data_dir.is_none()
    }

    /// Validates the storage configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size < MIN_PAGE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "page_size must be at least {} bytes",
                MIN_PAGE_SIZE
            )));
        }
        if !self.page_size.is_power_of_two() {
            return Err(ConfigError::Invalid(
                "page_size must be a power of 2".to_string(),
            ));
        }
        if let Some(dir) = &self.data_dir {
            if dir.as_os_str().is_empty() {
                return Err(ConfigError::Invalid("data_dir cannot be empty".to_string()));
            }
        }
        Ok(())
    }
}

/// Full-text index configuration.
///
/// Ignored nodes contribute no text. Inline nodes do not break words: text
/// on either side of an inline element is joined without a separator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Elements whose content is skipped.
    pub ignored_nodes: Vec<QName>,

    /// Elements treated as inline markup.
    pub inline_nodes: Vec<QName>,
}

impl IndexConfig {
    /// Returns true if `name` is configured as ignored.
    pub fn is_ignored_node(&self, name: &QName) -> bool {
        self.ignored_nodes.contains(name)
    }

    /// Returns true if `name` is configured as inline.
    pub fn is_inline_node(&self, name: &QName) -> bool {
        self.inline_nodes.contains(name)
    }
}

/// What to do when a cached plan is already checked out by another
/// execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanConflictMode {
    /// Compile an independent copy.
    #[default]
    Recompile,
    /// Wait for the copy to be checked in.
    Wait,
    /// Fail with a conflict error.
    Reject,
}

/// Query plan cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Distinct query sources kept in the cache.
    pub max_cached_queries: usize,

    /// Compiled copies kept per source.
    pub max_plan_copies: usize,

    /// Conflict resolution for busy plans.
    pub conflict_mode: PlanConflictMode,

    /// Checkout wait limit in milliseconds for [`PlanConflictMode::Wait`].
    pub checkout_wait_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_cached_queries: DEFAULT_MAX_CACHED_QUERIES,
            max_plan_copies: DEFAULT_MAX_PLAN_COPIES,
            conflict_mode: PlanConflictMode::default(),
            checkout_wait_ms: 5_000,
        }
    }
}

impl QueryConfig {
    /// Returns the checkout wait limit.
    pub fn checkout_wait(&self) -> Duration {
        Duration::from_millis(self.checkout_wait_ms)
    }

    /// Validates the cache bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_cached_queries == 0 || self.max_plan_copies == 0 {
            return Err(ConfigError::Invalid(
                "plan cache bounds must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DatabaseConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.storage.is_memory());
        assert_eq!(config.pool.shutdown_grace(), Duration::from_secs(1));
    }

    #[test]
    fn test_pool_bounds() {
        let mut pool = PoolSettings::default();
        pool.min_brokers = 0;
        assert!(pool.validate().is_err());

        pool.min_brokers = 5;
        pool.max_brokers = 4;
        assert!(pool.validate().is_err());

        pool.max_brokers = 5;
        assert!(pool.validate().is_ok());
    }

    #[test]
    fn test_page_size_validation() {
        let mut storage = StorageConfig::default();
        storage.page_size = 3000;
        assert!(storage.validate().is_err());
        storage.page_size = 512;
        assert!(storage.validate().is_err());
        storage.page_size = 8192;
        assert!(storage.validate().is_ok());
    }

    #[test]
    fn test_toml_round_trip() {
        let toml = r#"
            [pool]
            min_brokers = 2
            max_brokers = 8

            [index]
            ignored_nodes = ["note", "{urn:x}comment"]
            inline_nodes = ["b", "i"]

            [query]
            conflict_mode = "wait"
        "#;

        let config = DatabaseConfig::from_toml(toml).unwrap();
        assert_eq!(config.pool.min_brokers, 2);
        assert_eq!(config.pool.max_brokers, 8);
        assert_eq!(config.pool.acquire_timeout_ms, DEFAULT_ACQUIRE_TIMEOUT_MS);
        assert!(config.index.is_ignored_node(&QName::new("urn:x", "comment")));
        assert!(config.index.is_inline_node(&QName::local("b")));
        assert_eq!(config.query.conflict_mode, PlanConflictMode::Wait);

        let rendered = config.to_toml().unwrap();
        let again = DatabaseConfig::from_toml(&rendered).unwrap();
        assert_eq!(again.index.ignored_nodes, config.index.ignored_nodes);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf.toml");
        std::fs::write(&path, "[storage]\npage_size = 8192\n").unwrap();

        let config = DatabaseConfig::from_file(&path).unwrap();
        assert_eq!(config.storage.page_size, 8192);

        let missing = DatabaseConfig::from_file(&dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
