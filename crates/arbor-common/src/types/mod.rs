//! Type definitions for Arbor.
//!
//! This module contains the core value types shared across crates.

mod documents;
mod ids;
mod qname;
mod security;

pub use documents::DocumentSet;
pub use ids::{BrokerId, DocumentId, PlanId, PoolId};
pub use qname::QName;
pub use security::Subject;
