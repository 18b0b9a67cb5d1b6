//! Document storage seen through a broker.
//!
//! The real storage engine lives behind [`DocumentStore`]; brokers only
//! route calls to it. [`MemoryStore`] keeps documents in memory and backs
//! the server's memory mode and the tests.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use arbor_common::constants::ROOT_COLLECTION;
use arbor_common::types::{DocumentId, DocumentSet};
use parking_lot::RwLock;

use crate::error::{BrokerError, BrokerResult};

/// Storage operations available to broker sessions.
pub trait DocumentStore: Send + Sync + fmt::Debug {
    /// Returns every document below the collection `uri`.
    fn collection(&self, uri: &str) -> BrokerResult<DocumentSet>;

    /// Stores a document with its extracted full-text content, replacing any
    /// previous version at `path`.
    fn store(&self, path: &str, text: String) -> BrokerResult<DocumentId>;

    /// Returns the indexed text of a document.
    fn text(&self, path: &str) -> BrokerResult<String>;

    /// Removes a document. Returns false if it did not exist.
    fn remove(&self, path: &str) -> BrokerResult<bool>;
}

#[derive(Debug, Clone)]
struct StoredDocument {
    id: DocumentId,
    text: String,
}

/// An in-memory document store.
#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<BTreeMap<String, StoredDocument>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored documents.
    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    /// Returns true if no documents are stored.
    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }
}

fn check_path(path: &str) -> BrokerResult<()> {
    if !path.starts_with(ROOT_COLLECTION) {
        return Err(BrokerError::Storage(format!(
            "path '{}' is outside {}",
            path, ROOT_COLLECTION
        )));
    }
    Ok(())
}

impl DocumentStore for MemoryStore {
    fn collection(&self, uri: &str) -> BrokerResult<DocumentSet> {
        check_path(uri)?;
        let prefix = format!("{}/", uri.trim_end_matches('/'));
        let docs = self.docs.read();
        Ok(docs
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .map(|(path, doc)| (doc.id, path.clone()))
            .collect())
    }

    fn store(&self, path: &str, text: String) -> BrokerResult<DocumentId> {
        check_path(path)?;
        let mut docs = self.docs.write();
        if let Some(existing) = docs.get_mut(path) {
            existing.text = text;
            return Ok(existing.id);
        }
        let id = DocumentId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        docs.insert(path.to_string(), StoredDocument { id, text });
        Ok(id)
    }

    fn text(&self, path: &str) -> BrokerResult<String> {
        self.docs
            .read()
            .get(path)
            .map(|doc| doc.text.clone())
            .ok_or_else(|| BrokerError::DocumentNotFound(path.to_string()))
    }

    fn remove(&self, path: &str) -> BrokerResult<bool> {
        Ok(self.docs.write().remove(path).is_some())
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("documents", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_lists_descendants_only() {
        let store = MemoryStore::new();
        store.store("/db/test/a.xml", "a".into()).unwrap();
        store.store("/db/test/sub/b.xml", "b".into()).unwrap();
        store.store("/db/testing/c.xml", "c".into()).unwrap();

        let docs = store.collection("/db/test").unwrap();
        assert_eq!(docs.paths(), vec!["/db/test/a.xml", "/db/test/sub/b.xml"]);

        let docs = store.collection("/db/test/").unwrap();
        assert_eq!(docs.len(), 2);
    }

    #[test]
    fn test_store_replaces_in_place() {
        let store = MemoryStore::new();
        let first = store.store("/db/a.xml", "one".into()).unwrap();
        let second = store.store("/db/a.xml", "two".into()).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.text("/db/a.xml").unwrap(), "two");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_paths_outside_root_rejected() {
        let store = MemoryStore::new();
        assert!(store.store("/tmp/a.xml", String::new()).is_err());
        assert!(matches!(
            store.text("/db/missing.xml"),
            Err(BrokerError::DocumentNotFound(_))
        ));
        assert!(!store.remove("/db/missing.xml").unwrap());
    }
}
