//! Broker sessions.
//!
//! A `Broker` is the unit the pool lends out: one storage session acting on
//! behalf of one [`Subject`]. Brokers are never constructed by callers; they
//! come from [`BrokerPool::acquire`](crate::BrokerPool::acquire).

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arbor_common::config::DatabaseConfig;
use arbor_common::types::{BrokerId, DocumentId, DocumentSet, PoolId, Subject};
use arbor_index::{extract_text, DefaultTextExtractor, NodeEvent};

use crate::error::{BrokerError, BrokerResult};
use crate::store::DocumentStore;

/// A storage session.
pub struct Broker {
    /// Broker id, unique within its pool.
    id: BrokerId,
    /// The pool that created this broker.
    pool_id: PoolId,
    /// Lease generation, bumped by the pool at every checkout.
    generation: u64,
    /// Identity the session acts under.
    subject: Subject,
    /// Storage behind this session.
    store: Arc<dyn DocumentStore>,
    /// Database configuration.
    config: Arc<DatabaseConfig>,
    /// When the broker was created.
    created_at: Instant,
    /// Number of checkouts so far.
    use_count: u64,
}

impl Broker {
    pub(crate) fn new(
        id: BrokerId,
        pool_id: PoolId,
        store: Arc<dyn DocumentStore>,
        config: Arc<DatabaseConfig>,
    ) -> Self {
        Self {
            id,
            pool_id,
            generation: 0,
            subject: Subject::guest(),
            store,
            config,
            created_at: Instant::now(),
            use_count: 0,
        }
    }

    /// Hands the broker to a new owner.
    pub(crate) fn lease(&mut self, generation: u64, subject: Subject) {
        self.generation = generation;
        self.subject = subject;
        self.use_count += 1;
    }

    /// Clears per-owner state before the broker goes back to the free set.
    pub(crate) fn reset(&mut self) {
        self.subject = Subject::guest();
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the broker id.
    pub fn id(&self) -> BrokerId {
        self.id
    }

    /// Returns the id of the owning pool.
    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    /// Returns the acting subject.
    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    /// Switches the acting subject, returning the previous one.
    pub fn set_subject(&mut self, subject: Subject) -> Subject {
        std::mem::replace(&mut self.subject, subject)
    }

    /// Returns the database configuration.
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Returns how many times this broker has been checked out.
    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    /// Returns how long the broker has existed.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Returns the documents of a collection.
    pub fn collection(&self, uri: &str) -> BrokerResult<DocumentSet> {
        self.store.collection(uri)
    }

    /// Stores a document.
    ///
    /// The node events are run through the full-text extractor configured
    /// for this database before the document reaches storage.
    pub fn store_document(&self, path: &str, events: &[NodeEvent]) -> BrokerResult<DocumentId> {
        if self.config.storage.read_only {
            return Err(BrokerError::Storage("database is read-only".to_string()));
        }
        let mut extractor = DefaultTextExtractor::new(self.config.index.clone());
        let text = extract_text(&mut extractor, events);
        let id = self.store.store(path, text)?;
        tracing::debug!(broker = %self.id, subject = %self.subject, path, "stored document");
        Ok(id)
    }

    /// Returns the indexed text of a document.
    pub fn document_text(&self, path: &str) -> BrokerResult<String> {
        self.store.text(path)
    }

    /// Removes a document.
    pub fn remove_document(&self, path: &str) -> BrokerResult<bool> {
        if self.config.storage.read_only {
            return Err(BrokerError::Storage("database is read-only".to_string()));
        }
        self.store.remove(path)
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("id", &self.id)
            .field("pool_id", &self.pool_id)
            .field("subject", &self.subject.name())
            .field("use_count", &self.use_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use arbor_common::types::QName;

    fn broker(config: DatabaseConfig) -> Broker {
        Broker::new(
            BrokerId::new(1),
            PoolId::new(1),
            Arc::new(MemoryStore::new()),
            Arc::new(config),
        )
    }

    #[test]
    fn test_lease_and_reset() {
        let mut broker = broker(DatabaseConfig::default());
        broker.lease(7, Subject::system());
        assert_eq!(broker.generation(), 7);
        assert!(broker.subject().is_dba());
        assert_eq!(broker.use_count(), 1);

        broker.reset();
        assert_eq!(broker.subject(), &Subject::guest());
    }

    #[test]
    fn test_store_document_extracts_text() {
        let mut config = DatabaseConfig::default();
        config.index.ignored_nodes.push(QName::local("note"));
        let broker = broker(config);

        let events = vec![
            NodeEvent::start("doc"),
            NodeEvent::text("visible"),
            NodeEvent::start("note"),
            NodeEvent::text("hidden"),
            NodeEvent::end("note"),
            NodeEvent::end("doc"),
        ];
        broker.store_document("/db/test/a.xml", &events).unwrap();

        let text = broker.document_text("/db/test/a.xml").unwrap();
        assert_eq!(text.trim(), "visible");
        assert_eq!(broker.collection("/db/test").unwrap().len(), 1);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let mut config = DatabaseConfig::default();
        config.storage.read_only = true;
        let broker = broker(config);

        let result = broker.store_document("/db/a.xml", &[]);
        assert!(matches!(result, Err(BrokerError::Storage(_))));
        assert!(broker.remove_document("/db/a.xml").is_err());
    }
}
