//! Shutdown notifications.
//!
//! Pools do not call back into listener code. Each subscriber owns the
//! receiving end of a channel and consumes [`ShutdownEvent`]s on whatever
//! thread or task suits it.

use std::time::Duration;

use arbor_common::types::BrokerId;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

/// Published once per pool when its shutdown completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownEvent {
    /// Name of the pool that stopped.
    pub pool_name: String,
    /// Pool instances other than this one still active.
    pub remaining_instances: usize,
    /// True if active brokers were abandoned after the grace period.
    pub forced: bool,
}

/// Outcome of [`BrokerPool::shutdown`](crate::BrokerPool::shutdown).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Name of the pool.
    pub pool_name: String,
    /// Pool instances other than this one still active.
    pub remaining_instances: usize,
    /// True if the grace period elapsed with brokers still checked out.
    pub forced: bool,
    /// Brokers still checked out when the pool stopped.
    pub abandoned: Vec<BrokerId>,
    /// Idle brokers closed during shutdown.
    pub closed_brokers: usize,
    /// Time spent between the start of shutdown and the stop.
    pub elapsed: Duration,
}

impl ShutdownReport {
    pub(crate) fn event(&self) -> ShutdownEvent {
        ShutdownEvent {
            pool_name: self.pool_name.clone(),
            remaining_instances: self.remaining_instances,
            forced: self.forced,
        }
    }
}

/// Receives shutdown events.
#[derive(Debug)]
pub struct ShutdownListener {
    rx: UnboundedReceiver<ShutdownEvent>,
}

impl ShutdownListener {
    /// Waits for the next event. Returns `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<ShutdownEvent> {
        self.rx.recv().await
    }

    /// Blocking variant of [`recv`](Self::recv) for plain threads.
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context.
    pub fn blocking_recv(&mut self) -> Option<ShutdownEvent> {
        self.rx.blocking_recv()
    }

    /// Returns an already published event without waiting.
    pub fn try_recv(&mut self) -> Option<ShutdownEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }
}

/// The publishing side: one sender per subscriber.
///
/// Published events are kept, so a subscriber that arrives late is handed
/// them on subscription. Once the bus is closed no sender stays behind, and
/// a listener's `recv` returns `None` after the replayed events.
#[derive(Debug, Default)]
pub(crate) struct ShutdownBus {
    inner: Mutex<BusInner>,
}

#[derive(Debug, Default)]
struct BusInner {
    subscribers: Vec<UnboundedSender<ShutdownEvent>>,
    published: Vec<ShutdownEvent>,
    closed: bool,
}

impl ShutdownBus {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn subscribe(&self) -> ShutdownListener {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        for event in &inner.published {
            // The receiver is still in hand, so this cannot fail.
            let _ = tx.send(event.clone());
        }
        if !inner.closed {
            inner.subscribers.push(tx);
        }
        ShutdownListener { rx }
    }

    /// Delivers `event` to every live subscriber, dropping the ones whose
    /// listener is gone.
    pub(crate) fn publish(&self, event: &ShutdownEvent) -> usize {
        let mut inner = self.inner.lock();
        inner.published.push(event.clone());
        inner.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        inner.subscribers.len()
    }

    /// Stops accepting events. Current listeners see the end of the stream.
    pub(crate) fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(remaining: usize) -> ShutdownEvent {
        ShutdownEvent {
            pool_name: "test".to_string(),
            remaining_instances: remaining,
            forced: false,
        }
    }

    #[test]
    fn test_every_subscriber_gets_one_event() {
        let bus = ShutdownBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        assert_eq!(bus.publish(&event(0)), 2);

        assert_eq!(a.try_recv(), Some(event(0)));
        assert_eq!(a.try_recv(), None);
        assert_eq!(b.try_recv(), Some(event(0)));
        assert_eq!(b.try_recv(), None);
    }

    #[test]
    fn test_dropped_listeners_are_pruned() {
        let bus = ShutdownBus::new();
        let listener = bus.subscribe();
        let _kept = bus.subscribe();
        drop(listener);

        assert_eq!(bus.publish(&event(1)), 1);
        assert_eq!(bus.len(), 1);
    }

    #[tokio::test]
    async fn test_async_recv() {
        let bus = ShutdownBus::new();
        let mut listener = bus.subscribe();

        bus.publish(&event(0));
        let received = listener.recv().await.unwrap();
        assert_eq!(received.remaining_instances, 0);
    }

    #[test]
    fn test_late_subscriber_gets_published_events() {
        let bus = ShutdownBus::new();
        bus.publish(&event(1));
        bus.publish(&event(0));

        let mut late = bus.subscribe();
        assert_eq!(late.try_recv(), Some(event(1)));
        assert_eq!(late.try_recv(), Some(event(0)));
        assert_eq!(late.try_recv(), None);
        assert_eq!(bus.len(), 1);
    }

    #[tokio::test]
    async fn test_closed_bus_ends_the_stream() {
        let bus = ShutdownBus::new();
        let mut early = bus.subscribe();
        bus.publish(&event(0));
        bus.close();
        assert_eq!(bus.len(), 0);

        let mut late = bus.subscribe();
        assert_eq!(late.recv().await, Some(event(0)));
        assert_eq!(late.recv().await, None);
        assert_eq!(early.recv().await, Some(event(0)));
        assert_eq!(early.recv().await, None);
    }
}
