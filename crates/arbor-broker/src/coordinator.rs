//! Process-wide pool registry and shutdown sequencing.

use std::sync::Arc;

use arbor_common::config::DatabaseConfig;
use parking_lot::Mutex;
use tracing::info;

use crate::error::{BrokerError, BrokerResult};
use crate::pool::{BrokerPool, Instances, PoolState};
use crate::shutdown::{ShutdownBus, ShutdownListener, ShutdownReport};
use crate::store::{DocumentStore, MemoryStore};

/// Owns the broker pools of a process.
///
/// Every pool configured here shares one instance counter, so the
/// [`ShutdownEvent`](crate::ShutdownEvent) of the last pool to stop carries
/// `remaining_instances == 0`. Subscribers registered with
/// [`subscribe`](Self::subscribe) receive the event of every pool.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    pools: Mutex<Vec<Arc<BrokerPool>>>,
    instances: Arc<Instances>,
    bus: Arc<ShutdownBus>,
}

impl ShutdownCoordinator {
    /// Creates an empty coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures a pool backed by an in-memory store.
    ///
    /// `min` and `max` override the bounds in `config.pool`. A config that
    /// names a `data_dir` is refused with [`BrokerError::Configuration`].
    pub fn configure(
        &self,
        name: &str,
        min: usize,
        max: usize,
        config: DatabaseConfig,
    ) -> BrokerResult<Arc<BrokerPool>> {
        if let Some(dir) = &config.storage.data_dir {
            return Err(BrokerError::Configuration(format!(
                "no on-disk store for data_dir {}; use configure_with_store",
                dir.display()
            )));
        }
        self.configure_with_store(name, min, max, config, Arc::new(MemoryStore::new()))
    }

    /// Configures a pool over the given store.
    ///
    /// Pool names are never reused, not even after the pool has stopped.
    pub fn configure_with_store(
        &self,
        name: &str,
        min: usize,
        max: usize,
        mut config: DatabaseConfig,
        store: Arc<dyn DocumentStore>,
    ) -> BrokerResult<Arc<BrokerPool>> {
        let mut pools = self.pools.lock();
        if pools.iter().any(|p| p.name() == name) {
            return Err(BrokerError::AlreadyConfigured(name.to_string()));
        }

        config.pool.min_brokers = min;
        config.pool.max_brokers = max;
        let pool = BrokerPool::with_instances(
            name.to_string(),
            config,
            store,
            Arc::clone(&self.instances),
            Some(Arc::clone(&self.bus)),
        )?;
        pools.push(Arc::clone(&pool));
        Ok(pool)
    }

    /// Returns the pool with the given name.
    pub fn pool(&self, name: &str) -> Option<Arc<BrokerPool>> {
        self.pools.lock().iter().find(|p| p.name() == name).cloned()
    }

    /// Returns the state of the named pool, or `Unconfigured` if there is none.
    pub fn state(&self, name: &str) -> PoolState {
        self.pool(name)
            .map_or(PoolState::Unconfigured, |p| p.state())
    }

    /// Returns true if a pool was ever configured under `name`, whatever
    /// its state now. Such a name cannot be configured again.
    pub fn is_configured(&self, name: &str) -> bool {
        self.state(name) != PoolState::Unconfigured
    }

    /// Returns the number of pools that have not stopped.
    pub fn active_instances(&self) -> usize {
        self.instances.active()
    }

    /// Returns the number of live subscribers.
    pub fn listener_count(&self) -> usize {
        self.bus.len()
    }

    /// Subscribes to the shutdown events of every pool.
    ///
    /// Events of pools that already stopped are delivered first, in the
    /// order they were published.
    pub fn subscribe(&self) -> ShutdownListener {
        self.bus.subscribe()
    }

    /// Shuts down every pool, in configuration order.
    ///
    /// Blocks until each pool has stopped. Pools that already stopped
    /// contribute their original report.
    pub fn stop_all(&self, wait_for_active: bool) -> Vec<ShutdownReport> {
        // Not holding the registry lock while pools drain.
        let pools: Vec<_> = self.pools.lock().clone();
        info!(pools = pools.len(), wait_for_active, "stopping all broker pools");
        pools.iter().map(|p| p.shutdown(wait_for_active)).collect()
    }
}
