//! Document sets.

use std::collections::BTreeMap;

use super::DocumentId;

/// The set of documents an expression's evaluation is scoped to.
///
/// Ordered by document id so iteration is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentSet {
    docs: BTreeMap<DocumentId, String>,
}

impl DocumentSet {
    /// Creates an empty document set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a document. Returns false if it was already present.
    pub fn insert(&mut self, id: DocumentId, path: impl Into<String>) -> bool {
        self.docs.insert(id, path.into()).is_none()
    }

    /// Returns true if the set contains the document.
    pub fn contains(&self, id: DocumentId) -> bool {
        self.docs.contains_key(&id)
    }

    /// Adds every document of `other` to this set.
    pub fn merge(&mut self, other: &DocumentSet) {
        for (id, path) in &other.docs {
            self.docs.entry(*id).or_insert_with(|| path.clone());
        }
    }

    /// Returns the number of documents.
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Iterates over `(id, path)` pairs in id order.
    pub fn iter(&self) -> impl Iterator<Item = (DocumentId, &str)> {
        self.docs.iter().map(|(id, path)| (*id, path.as_str()))
    }

    /// Returns the document paths in id order.
    pub fn paths(&self) -> Vec<String> {
        self.docs.values().cloned().collect()
    }
}

impl FromIterator<(DocumentId, String)> for DocumentSet {
    fn from_iter<T: IntoIterator<Item = (DocumentId, String)>>(iter: T) -> Self {
        Self {
            docs: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_merge() {
        let mut a = DocumentSet::new();
        assert!(a.insert(DocumentId::new(2), "/db/b.xml"));
        assert!(!a.insert(DocumentId::new(2), "/db/b.xml"));

        let b: DocumentSet = vec![
            (DocumentId::new(1), "/db/a.xml".to_string()),
            (DocumentId::new(2), "/db/b.xml".to_string()),
        ]
        .into_iter()
        .collect();

        a.merge(&b);
        assert_eq!(a.len(), 2);
        assert!(a.contains(DocumentId::new(1)));
        assert_eq!(a.paths(), vec!["/db/a.xml", "/db/b.xml"]);
    }

    #[test]
    fn test_empty() {
        let set = DocumentSet::default();
        assert!(set.is_empty());
        assert_eq!(set.iter().count(), 0);
    }
}
