//! Broker pool.
//!
//! Lends a bounded set of [`Broker`]s to callers, one caller per broker.
//!
//! # Lifecycle
//!
//! ```text
//! Unconfigured ──configure──▶ Running ──shutdown──▶ ShuttingDown ──drained/grace──▶ Stopped
//! ```
//!
//! Transitions only move forward. `acquire` succeeds only while `Running`;
//! a second `shutdown` call joins the one already in progress.
//!
//! # Fairness
//!
//! Callers that have to wait take a ticket. A free broker always goes to the
//! oldest ticket, and a newcomer never overtakes a queued waiter, so a waiter
//! is served after at most `waiters ahead of it` releases.

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use arbor_common::config::DatabaseConfig;
use arbor_common::types::{BrokerId, PoolId, Subject};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::error::{BrokerError, BrokerResult};
use crate::shutdown::{ShutdownBus, ShutdownListener, ShutdownReport};
use crate::store::DocumentStore;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Pool lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// No pool exists under the requested name.
    Unconfigured,
    /// Lending brokers.
    Running,
    /// Shutdown has begun; waiting for active brokers.
    ShuttingDown,
    /// Stopped for good.
    Stopped,
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PoolState::Unconfigured => "unconfigured",
            PoolState::Running => "running",
            PoolState::ShuttingDown => "shutting down",
            PoolState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Brokers created over the pool's lifetime.
    pub brokers_created: u64,
    /// Successful acquisitions.
    pub acquisitions: u64,
    /// Successful releases.
    pub releases: u64,
    /// Acquisitions that timed out.
    pub timeouts: u64,
    /// Idle brokers.
    pub free: usize,
    /// Checked-out brokers.
    pub active: usize,
    /// Configured upper bound.
    pub max: usize,
}

/// Count of pool instances that have not stopped yet.
///
/// Shared by every pool configured through one
/// [`ShutdownCoordinator`](crate::ShutdownCoordinator).
#[derive(Debug, Default)]
pub(crate) struct Instances {
    active: AtomicUsize,
}

impl Instances {
    pub(crate) fn activate(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    /// Marks one instance stopped and returns how many remain.
    pub(crate) fn deactivate(&self) -> usize {
        self.active.fetch_sub(1, Ordering::AcqRel).saturating_sub(1)
    }

    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// Bookkeeping for a checked-out broker.
#[derive(Debug, Clone)]
struct Lease {
    generation: u64,
    owner: ThreadId,
    since: Instant,
}

/// State guarded by the pool mutex.
struct PoolInner {
    lifecycle: PoolState,
    /// Idle brokers.
    free: Vec<Broker>,
    /// Leases of brokers currently lent out.
    checked_out: HashMap<BrokerId, Lease>,
    /// Leases abandoned by a forced teardown. Their late releases are
    /// accepted and the brokers discarded.
    abandoned: HashMap<BrokerId, u64>,
    next_broker_id: BrokerId,
    next_generation: u64,
    /// Waiting acquirers in arrival order.
    waiters: VecDeque<u64>,
    next_ticket: u64,
    report: Option<ShutdownReport>,
}

impl PoolInner {
    fn total(&self) -> usize {
        self.free.len() + self.checked_out.len()
    }
}

/// A bounded pool of broker sessions.
pub struct BrokerPool {
    id: PoolId,
    name: String,
    config: Arc<DatabaseConfig>,
    store: Arc<dyn DocumentStore>,
    state: Mutex<PoolInner>,
    /// Signalled when a broker is released or shutdown begins.
    capacity: Condvar,
    /// Signalled when a lease ends or the pool stops.
    drained: Condvar,
    bus: ShutdownBus,
    coordinator_bus: Option<Arc<ShutdownBus>>,
    instances: Arc<Instances>,
    brokers_created: AtomicU64,
    acquisitions: AtomicU64,
    releases: AtomicU64,
    timeouts: AtomicU64,
}

impl BrokerPool {
    /// Creates a standalone pool.
    ///
    /// `config.pool` supplies the `(min, max)` bounds; `min` brokers are
    /// created immediately.
    pub fn new(
        name: impl Into<String>,
        config: DatabaseConfig,
        store: Arc<dyn DocumentStore>,
    ) -> BrokerResult<Arc<Self>> {
        Self::with_instances(name.into(), config, store, Arc::new(Instances::default()), None)
    }

    pub(crate) fn with_instances(
        name: String,
        config: DatabaseConfig,
        store: Arc<dyn DocumentStore>,
        instances: Arc<Instances>,
        coordinator_bus: Option<Arc<ShutdownBus>>,
    ) -> BrokerResult<Arc<Self>> {
        config.validate()?;

        let id = PoolId::new(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed));
        let config = Arc::new(config);
        let min = config.pool.min_brokers;

        let mut free = Vec::with_capacity(min);
        let mut next_broker_id = BrokerId::new(1);
        for _ in 0..min {
            free.push(Broker::new(
                next_broker_id,
                id,
                Arc::clone(&store),
                Arc::clone(&config),
            ));
            next_broker_id = next_broker_id.next();
        }

        instances.activate();
        info!(
            pool = %name,
            min = min,
            max = config.pool.max_brokers,
            "broker pool configured"
        );

        Ok(Arc::new(Self {
            id,
            name,
            store,
            state: Mutex::new(PoolInner {
                lifecycle: PoolState::Running,
                free,
                checked_out: HashMap::new(),
                abandoned: HashMap::new(),
                next_broker_id,
                next_generation: 1,
                waiters: VecDeque::new(),
                next_ticket: 0,
                report: None,
            }),
            capacity: Condvar::new(),
            drained: Condvar::new(),
            bus: ShutdownBus::new(),
            coordinator_bus,
            instances,
            brokers_created: AtomicU64::new(min as u64),
            acquisitions: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            config,
        }))
    }

    /// Returns the pool id.
    pub fn id(&self) -> PoolId {
        self.id
    }

    /// Returns the pool name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the database configuration.
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> PoolState {
        self.state.lock().lifecycle
    }

    /// Returns true while the pool lends brokers.
    pub fn is_running(&self) -> bool {
        self.state() == PoolState::Running
    }

    /// Returns the number of checked-out brokers.
    pub fn active(&self) -> usize {
        self.state.lock().checked_out.len()
    }

    /// Returns the number of idle brokers.
    pub fn available(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Returns the ids of the checked-out brokers.
    pub fn active_brokers(&self) -> Vec<BrokerId> {
        let mut ids: Vec<_> = self.state.lock().checked_out.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Returns pool statistics.
    pub fn stats(&self) -> PoolStats {
        let inner = self.state.lock();
        PoolStats {
            brokers_created: self.brokers_created.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            free: inner.free.len(),
            active: inner.checked_out.len(),
            max: self.config.pool.max_brokers,
        }
    }

    /// Acquires a broker using the configured acquire timeout.
    pub fn get(self: &Arc<Self>, subject: Subject) -> BrokerResult<PooledBroker> {
        self.acquire(subject, self.config.pool.acquire_timeout())
    }

    /// Acquires a broker acting as `subject`.
    ///
    /// Returns an idle broker, creates one while the pool is below its
    /// bound, or waits up to `timeout` for a release.
    pub fn acquire(self: &Arc<Self>, subject: Subject, timeout: Duration) -> BrokerResult<PooledBroker> {
        // Too far out to represent means no deadline at all.
        let deadline = Instant::now().checked_add(timeout);
        let mut inner = self.state.lock();
        let mut ticket: Option<u64> = None;

        loop {
            if inner.lifecycle != PoolState::Running {
                if let Some(t) = ticket {
                    inner.waiters.retain(|w| *w != t);
                }
                return Err(BrokerError::PoolShuttingDown(self.name.clone()));
            }

            let my_turn = match ticket {
                None => inner.waiters.is_empty(),
                Some(t) => inner.waiters.front() == Some(&t),
            };

            if my_turn {
                if let Some(mut broker) = self.take_or_create(&mut inner) {
                    if ticket.is_some() {
                        inner.waiters.pop_front();
                    }

                    let generation = inner.next_generation;
                    inner.next_generation += 1;
                    broker.lease(generation, subject);
                    inner.checked_out.insert(
                        broker.id(),
                        Lease {
                            generation,
                            owner: thread::current().id(),
                            since: Instant::now(),
                        },
                    );

                    // The next waiter may be able to proceed as well.
                    if !inner.waiters.is_empty() {
                        self.capacity.notify_all();
                    }
                    drop(inner);

                    self.acquisitions.fetch_add(1, Ordering::Relaxed);
                    debug!(pool = %self.name, broker = %broker.id(), subject = %broker.subject(), "broker acquired");
                    return Ok(PooledBroker {
                        pool: Arc::clone(self),
                        broker: Some(broker),
                    });
                }
            }

            let t = match ticket {
                Some(t) => t,
                None => {
                    let t = inner.next_ticket;
                    inner.next_ticket += 1;
                    inner.waiters.push_back(t);
                    ticket = Some(t);
                    t
                }
            };

            let timed_out = match deadline {
                Some(deadline) => self.capacity.wait_until(&mut inner, deadline).timed_out(),
                None => {
                    self.capacity.wait(&mut inner);
                    false
                }
            };
            if timed_out {
                inner.waiters.retain(|w| *w != t);
                // Whoever is now at the front may have been waiting on us.
                self.capacity.notify_all();
                drop(inner);

                self.timeouts.fetch_add(1, Ordering::Relaxed);
                debug!(pool = %self.name, ?timeout, "broker acquire timed out");
                return Err(BrokerError::AcquireTimeout {
                    pool: self.name.clone(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
        }
    }

    fn take_or_create(&self, inner: &mut PoolInner) -> Option<Broker> {
        if let Some(broker) = inner.free.pop() {
            return Some(broker);
        }
        if inner.total() < self.config.pool.max_brokers {
            let id = inner.next_broker_id;
            inner.next_broker_id = id.next();
            self.brokers_created.fetch_add(1, Ordering::Relaxed);
            debug!(pool = %self.name, broker = %id, "creating broker");
            return Some(Broker::new(
                id,
                self.id,
                Arc::clone(&self.store),
                Arc::clone(&self.config),
            ));
        }
        None
    }

    /// Returns a broker to the pool.
    ///
    /// Fails with [`BrokerError::NotOwned`] when the broker was not lent out
    /// by this pool under its current lease. That is an invariant violation
    /// and is logged as an error.
    pub fn release(&self, mut broker: Broker) -> BrokerResult<()> {
        if broker.pool_id() != self.id {
            error!(
                pool = %self.name,
                broker = %broker.id(),
                owner_pool = %broker.pool_id(),
                "broker released to a foreign pool"
            );
            return Err(self.not_owned(broker.id()));
        }

        let mut inner = self.state.lock();
        let lease_matches = inner
            .checked_out
            .get(&broker.id())
            .is_some_and(|lease| lease.generation == broker.generation());

        if !lease_matches {
            if inner.abandoned.get(&broker.id()) == Some(&broker.generation()) {
                inner.abandoned.remove(&broker.id());
                debug!(pool = %self.name, broker = %broker.id(), "discarding broker released after forced shutdown");
                return Ok(());
            }
            drop(inner);
            error!(
                pool = %self.name,
                broker = %broker.id(),
                "broker released but not checked out (double or stale release)"
            );
            return Err(self.not_owned(broker.id()));
        }

        if let Some(lease) = inner.checked_out.remove(&broker.id()) {
            debug!(
                pool = %self.name,
                broker = %broker.id(),
                held_for = ?lease.since.elapsed(),
                "broker released"
            );
        }
        self.releases.fetch_add(1, Ordering::Relaxed);

        if inner.lifecycle == PoolState::Running {
            broker.reset();
            inner.free.push(broker);
            self.capacity.notify_all();
        }
        if inner.checked_out.is_empty() {
            self.drained.notify_all();
        }
        Ok(())
    }

    fn not_owned(&self, broker: BrokerId) -> BrokerError {
        BrokerError::NotOwned {
            pool: self.name.clone(),
            broker,
        }
    }

    /// Subscribes to this pool's shutdown event.
    ///
    /// A listener created after the pool stopped receives the event at once,
    /// and the stream ends after it.
    pub fn subscribe_shutdown(&self) -> ShutdownListener {
        self.bus.subscribe()
    }

    /// Shuts the pool down.
    ///
    /// New acquisitions fail with [`BrokerError::PoolShuttingDown`] from the
    /// moment this is called. With `wait_for_active`, blocks until every
    /// checked-out broker is released or the configured grace period
    /// elapses; in the latter case the remaining leases are abandoned and
    /// the report is marked `forced`. Every subscriber then receives one
    /// [`ShutdownEvent`](crate::ShutdownEvent).
    ///
    /// Calling this again, concurrently or later, waits for the first call
    /// to finish and returns its report.
    pub fn shutdown(&self, wait_for_active: bool) -> ShutdownReport {
        let mut inner = self.state.lock();
        match inner.lifecycle {
            PoolState::Running => {}
            PoolState::ShuttingDown | PoolState::Stopped | PoolState::Unconfigured => {
                while inner.report.is_none() {
                    self.drained.wait(&mut inner);
                }
                if let Some(report) = &inner.report {
                    return report.clone();
                }
            }
        }

        let started = Instant::now();
        inner.lifecycle = PoolState::ShuttingDown;
        info!(
            pool = %self.name,
            active = inner.checked_out.len(),
            wait_for_active,
            "shutting down broker pool"
        );
        // Queued acquirers fail from here on.
        self.capacity.notify_all();

        if wait_for_active {
            let deadline = started.checked_add(self.config.pool.shutdown_grace());
            while !inner.checked_out.is_empty() {
                match deadline {
                    Some(deadline) => {
                        if self.drained.wait_until(&mut inner, deadline).timed_out() {
                            break;
                        }
                    }
                    None => self.drained.wait(&mut inner),
                }
            }
        }

        let leases: Vec<(BrokerId, Lease)> = inner.checked_out.drain().collect();
        let mut abandoned: Vec<BrokerId> = Vec::with_capacity(leases.len());
        for (id, lease) in leases {
            warn!(
                pool = %self.name,
                broker = %id,
                owner = ?lease.owner,
                held_for = ?lease.since.elapsed(),
                "abandoning active broker"
            );
            inner.abandoned.insert(id, lease.generation);
            abandoned.push(id);
        }
        abandoned.sort();

        let forced = !abandoned.is_empty();
        if forced {
            warn!(
                pool = %self.name,
                abandoned = abandoned.len(),
                "forced teardown: brokers still active after grace period"
            );
        }

        let closed_brokers = inner.free.len();
        inner.free.clear();
        inner.waiters.clear();
        inner.lifecycle = PoolState::Stopped;

        let report = ShutdownReport {
            pool_name: self.name.clone(),
            remaining_instances: self.instances.deactivate(),
            forced,
            abandoned,
            closed_brokers,
            elapsed: started.elapsed(),
        };

        let event = report.event();
        let delivered = self.bus.publish(&event)
            + self
                .coordinator_bus
                .as_ref()
                .map_or(0, |bus| bus.publish(&event));
        // This pool has nothing more to say.
        self.bus.close();

        info!(
            pool = %self.name,
            remaining = report.remaining_instances,
            forced,
            listeners = delivered,
            "broker pool stopped"
        );

        inner.report = Some(report.clone());
        self.drained.notify_all();
        report
    }
}

impl std::fmt::Debug for BrokerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerPool")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("max_brokers", &self.config.pool.max_brokers)
            .field("active", &self.active())
            .field("available", &self.available())
            .finish()
    }
}

/// A broker checked out of a pool.
///
/// Dropping the guard returns the broker. [`release`](Self::release) does the
/// same but reports failures to the caller.
pub struct PooledBroker {
    pool: Arc<BrokerPool>,
    broker: Option<Broker>,
}

impl PooledBroker {
    /// Returns the broker to the pool.
    pub fn release(mut self) -> BrokerResult<()> {
        match self.broker.take() {
            Some(broker) => self.pool.release(broker),
            None => Ok(()),
        }
    }

    /// Detaches the broker from the guard.
    ///
    /// The caller becomes responsible for passing it to
    /// [`BrokerPool::release`].
    pub fn into_inner(mut self) -> Option<Broker> {
        self.broker.take()
    }

    /// Returns the pool the broker came from.
    pub fn pool(&self) -> &Arc<BrokerPool> {
        &self.pool
    }
}

impl Deref for PooledBroker {
    type Target = Broker;

    fn deref(&self) -> &Broker {
        // Only `release` and `into_inner` take the broker, and both consume
        // the guard.
        match &self.broker {
            Some(broker) => broker,
            None => unreachable!("pooled broker used after release"),
        }
    }
}

impl DerefMut for PooledBroker {
    fn deref_mut(&mut self) -> &mut Broker {
        match &mut self.broker {
            Some(broker) => broker,
            None => unreachable!("pooled broker used after release"),
        }
    }
}

impl Drop for PooledBroker {
    fn drop(&mut self) {
        if let Some(broker) = self.broker.take() {
            if let Err(e) = self.pool.release(broker) {
                error!(pool = %self.pool.name(), error = %e, "failed to return broker on drop");
            }
        }
    }
}

impl std::fmt::Debug for PooledBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBroker")
            .field("pool", &self.pool.name())
            .field("broker", &self.broker)
            .finish()
    }
}
