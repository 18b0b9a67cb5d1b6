//! Configuration for Arbor.
//!
//! This module provides configuration structures for the broker pool, the
//! storage layer, full-text indexing, and the query plan cache.

mod database;

pub use database::{
    ConfigError, DatabaseConfig, IndexConfig, PlanConflictMode, PoolSettings, QueryConfig,
    StorageConfig,
};
