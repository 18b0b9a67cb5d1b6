//! Error types for broker sessions and pools.

use arbor_common::config::ConfigError;
use arbor_common::types::BrokerId;
use thiserror::Error;

/// Broker and pool errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Invalid pool bounds or storage configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A pool with this name was already configured.
    #[error("broker pool '{0}' is already configured")]
    AlreadyConfigured(String),

    /// No broker became available within the timeout.
    #[error("timed out after {timeout_ms}ms waiting for a broker from pool '{pool}'")]
    AcquireTimeout {
        /// Pool name.
        pool: String,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// The pool no longer lends out brokers.
    #[error("broker pool '{0}' is shutting down")]
    PoolShuttingDown(String),

    /// A broker was released to a pool that did not lend it out, or was
    /// released more than once.
    #[error("{broker} is not checked out from pool '{pool}'")]
    NotOwned {
        /// Pool name.
        pool: String,
        /// The offending broker.
        broker: BrokerId,
    },

    /// The storage layer rejected an operation.
    #[error("storage error: {0}")]
    Storage(String),

    /// A document does not exist.
    #[error("document not found: {0}")]
    DocumentNotFound(String),
}

impl BrokerError {
    /// Returns true for errors a caller may resolve by retrying later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::AcquireTimeout { .. })
    }
}

impl From<ConfigError> for BrokerError {
    fn from(e: ConfigError) -> Self {
        BrokerError::Configuration(e.to_string())
    }
}

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;
