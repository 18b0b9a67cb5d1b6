//! # arbor-server
//!
//! Server process for Arbor.
//!
//! This crate provides:
//!
//! - **Configuration**: [`ServerConfig`], a TOML file wrapping the
//!   database configuration with listener settings
//!
//! - **Front end**: [`StatusServer`], a line-oriented TCP listener that runs
//!   queries on pooled brokers and reports pool status
//!
//! The `arbord` binary wires both to a
//! [`ShutdownCoordinator`](arbor_broker::ShutdownCoordinator) and stops the
//! listener once the last pool has shut down.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Server configuration.
pub mod config;

/// TCP front end.
pub mod server;

pub use config::{ServerConfig, ServerConfigBuilder};
pub use server::{PoolStatus, Response, StatusServer, StopHandle};
