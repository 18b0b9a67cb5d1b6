//! # arbor-common
//!
//! Common types, configuration, and constants for Arbor.
//!
//! This crate provides the foundational types shared by every Arbor
//! component:
//!
//! - **Types**: Identifiers (`BrokerId`, `PoolId`, `PlanId`, `DocumentId`),
//!   qualified names, document sets, and the acting `Subject`
//! - **Config**: Database, storage, and index configuration
//! - **Constants**: System-wide defaults and limits
//!
//! ## Example
//!
//! ```rust
//! use arbor_common::config::DatabaseConfig;
//! use arbor_common::types::{DocumentId, DocumentSet, Subject};
//!
//! let config = DatabaseConfig::default();
//! assert!(config.validate().is_ok());
//!
//! let mut docs = DocumentSet::new();
//! docs.insert(DocumentId::new(1), "/db/test/a.xml");
//! assert_eq!(docs.len(), 1);
//!
//! let admin = Subject::system();
//! assert!(admin.is_dba());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod constants;
pub mod types;

pub use config::{ConfigError, DatabaseConfig, IndexConfig, PoolSettings, QueryConfig, StorageConfig};
pub use constants::*;
pub use types::{BrokerId, DocumentId, DocumentSet, PlanId, PoolId, QName, Subject};
