//! # arbor-test
//!
//! Integration tests for Arbor.
//!
//! This crate contains:
//! - Binding cleanup tests running real queries through the plan cache
//! - Broker pool and shutdown tests across threads
//! - Server tests over TCP

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Test utilities and helpers
pub mod utils;
