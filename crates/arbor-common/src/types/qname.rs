//! Qualified XML names.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A namespace-qualified name.
///
/// Equality and hashing consider only the namespace URI and the local name;
/// the prefix is kept for display.
///
/// The serialized form is Clark notation (`{namespace}local`), or the bare
/// local name when no namespace is set.
///
/// # Example
///
/// ```rust
/// use arbor_common::types::QName;
///
/// let a = QName::parse("{http://exist-db.org/test}test");
/// let b = QName::new("http://exist-db.org/test", "test").with_prefix("t");
/// assert_eq!(a, b);
/// assert_eq!(b.to_string(), "t:test");
/// ```
#[derive(Clone, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct QName {
    namespace: String,
    local_name: String,
    prefix: Option<String>,
}

impl QName {
    /// Creates a name in the given namespace.
    pub fn new(namespace: impl Into<String>, local_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            local_name: local_name.into(),
            prefix: None,
        }
    }

    /// Creates a name without a namespace.
    pub fn local(local_name: impl Into<String>) -> Self {
        Self::new(String::new(), local_name)
    }

    /// Sets the display prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Parses Clark notation or a bare local name.
    pub fn parse(s: &str) -> Self {
        if let Some(rest) = s.strip_prefix('{') {
            if let Some((ns, local)) = rest.split_once('}') {
                return Self::new(ns, local);
            }
        }
        Self::local(s)
    }

    /// Returns the namespace URI, empty when unqualified.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the local part of the name.
    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// Returns the display prefix, if any.
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Returns the name in Clark notation.
    pub fn to_clark(&self) -> String {
        if self.namespace.is_empty() {
            self.local_name.clone()
        } else {
            format!("{{{}}}{}", self.namespace, self.local_name)
        }
    }
}

impl PartialEq for QName {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace && self.local_name == other.local_name
    }
}

impl std::hash::Hash for QName {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.namespace.hash(state);
        self.local_name.hash(state);
    }
}

impl From<String> for QName {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<QName> for String {
    fn from(name: QName) -> Self {
        name.to_clark()
    }
}

impl fmt::Debug for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QName({})", self.to_clark())
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.prefix {
            Some(prefix) => write!(f, "{}:{}", prefix, self.local_name),
            None => write!(f, "{}", self.local_name),
        }
    }
}
