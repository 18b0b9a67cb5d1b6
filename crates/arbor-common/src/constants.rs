//! System-wide constants for Arbor.

// =============================================================================
// Broker Pool Constants
// =============================================================================

/// Name of the default broker pool instance.
pub const DEFAULT_POOL_NAME: &str = "arbor";

/// Default minimum number of brokers created when a pool is configured.
pub const DEFAULT_MIN_BROKERS: usize = 1;

/// Default maximum number of brokers a pool may hand out concurrently.
pub const DEFAULT_MAX_BROKERS: usize = 20;

/// Default time a caller waits for a free broker (30 seconds).
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 30_000;

/// Default grace period granted to active brokers during shutdown.
///
/// After this elapses a forced teardown proceeds.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 1_000;

// =============================================================================
// Query Plan Constants
// =============================================================================

/// Default number of distinct query sources kept in the plan cache.
pub const DEFAULT_MAX_CACHED_QUERIES: usize = 128;

/// Default number of independent compiled copies kept per query source.
pub const DEFAULT_MAX_PLAN_COPIES: usize = 8;

// =============================================================================
// Storage Constants
// =============================================================================

/// Root collection of every database.
pub const ROOT_COLLECTION: &str = "/db";

/// Minimum page size accepted by the storage configuration (1 KB).
pub const MIN_PAGE_SIZE: usize = 1024;

/// Default page size for document storage (4 KB).
pub const DEFAULT_PAGE_SIZE: usize = 4 * 1024;

/// Name of the database administrator account.
pub const DBA_USER: &str = "admin";

/// Name of the anonymous account used when no identity is supplied.
pub const GUEST_USER: &str = "guest";
