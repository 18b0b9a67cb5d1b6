//! # arbor-broker
//!
//! Broker sessions and the pool that hands them out.
//!
//! A [`Broker`] is one caller's gateway to document storage. Brokers are
//! expensive to set up, so a [`BrokerPool`] keeps a bounded set of them and
//! lends them out one caller at a time:
//!
//! - **Bounded**: never more than `max_brokers` exist at once; callers past
//!   the bound wait (in arrival order) until one is released or their
//!   timeout elapses
//! - **Exclusive**: a checked-out broker belongs to exactly one caller until
//!   it is released; releasing a broker the pool did not lend out fails with
//!   [`BrokerError::NotOwned`]
//! - **Graceful shutdown**: [`BrokerPool::shutdown`] stops lending, waits a
//!   bounded grace period for active brokers, then publishes a
//!   [`ShutdownEvent`] to every subscriber
//!
//! The [`ShutdownCoordinator`] owns every pool of the process and sequences
//! their shutdown; the subscriber that sees `remaining_instances == 0` is
//! the trigger for final teardown.
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! use arbor_broker::ShutdownCoordinator;
//! use arbor_common::config::DatabaseConfig;
//! use arbor_common::types::Subject;
//!
//! let coordinator = ShutdownCoordinator::new();
//! let pool = coordinator
//!     .configure("arbor", 1, 5, DatabaseConfig::default())
//!     .unwrap();
//! let mut events = coordinator.subscribe();
//!
//! {
//!     let broker = pool.acquire(Subject::guest(), Duration::from_secs(1)).unwrap();
//!     assert_eq!(broker.subject().name(), "guest");
//! } // returned to the pool here
//!
//! coordinator.stop_all(true);
//! let event = events.try_recv().unwrap();
//! assert_eq!(event.remaining_instances, 0);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod broker;
mod coordinator;
mod error;
mod pool;
mod shutdown;
mod store;

pub use broker::Broker;
pub use coordinator::ShutdownCoordinator;
pub use error::{BrokerError, BrokerResult};
pub use pool::{BrokerPool, PoolState, PoolStats, PooledBroker};
pub use shutdown::{ShutdownEvent, ShutdownListener, ShutdownReport};
pub use store::{DocumentStore, MemoryStore};
