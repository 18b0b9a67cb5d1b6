//! The identity a broker session acts under.
//!
//! Authentication and permission checks belong to the security subsystem;
//! this crate only carries the resulting principal around.

use std::fmt;

use crate::constants::{DBA_USER, GUEST_USER};

/// A security principal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subject {
    name: String,
    groups: Vec<String>,
    dba: bool,
}

impl Subject {
    /// Creates a regular user subject.
    pub fn user(name: impl Into<String>, groups: Vec<String>) -> Self {
        Self {
            name: name.into(),
            groups,
            dba: false,
        }
    }

    /// The system subject, used for internal tasks such as startup and
    /// shutdown.
    pub fn system() -> Self {
        Self {
            name: DBA_USER.to_string(),
            groups: vec!["dba".to_string()],
            dba: true,
        }
    }

    /// The anonymous subject.
    pub fn guest() -> Self {
        Self {
            name: GUEST_USER.to_string(),
            groups: vec![GUEST_USER.to_string()],
            dba: false,
        }
    }

    /// Returns the account name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the group memberships.
    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    /// Returns true for database administrators.
    pub fn is_dba(&self) -> bool {
        self.dba
    }

    /// Returns true if the subject is a member of `group`.
    pub fn has_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

impl Default for Subject {
    fn default() -> Self {
        Self::guest()
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}
