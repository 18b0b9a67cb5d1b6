//! Core identifier types for Arbor.
//!
//! These types provide type-safe wrappers around numeric identifiers,
//! preventing accidental misuse of different ID types.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new identifier from a raw u64 value.
            #[inline]
            #[must_use]
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// Returns the next identifier.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                Self(self.0.saturating_add(1))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(id: u64) -> Self {
                Self::new(id)
            }
        }

        impl From<$name> for u64 {
            #[inline]
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id!(
    /// Broker identifier, unique within one pool.
    ///
    /// # Example
    ///
    /// ```rust
    /// use arbor_common::types::BrokerId;
    ///
    /// let id = BrokerId::new(3);
    /// assert_eq!(id.to_string(), "broker-3");
    /// ```
    BrokerId,
    "broker-"
);

define_id!(
    /// Pool identifier, unique within the process.
    PoolId,
    "pool-"
);

define_id!(
    /// Compiled plan identifier. Every compilation gets a fresh id, so two
    /// independently compiled copies of the same query never share one.
    PlanId,
    "plan-"
);

define_id!(
    /// Stored document identifier.
    DocumentId,
    "doc-"
);
