//! # arbor-xquery
//!
//! Compiled query plans and the protocol that lets many executions reuse
//! them.
//!
//! A [`CompiledPlan`] is immutable once built. Everything an execution
//! writes while it runs (function arguments, context document sets, closure
//! captures, global variable values) goes into the plan's
//! [`BindingTable`], which the plan lends to one execution at a time:
//!
//! - **Checkout**: [`CompiledPlan::checkout`] hands out an
//!   [`ExecutionTicket`] owning the table; a busy plan either waits or
//!   rejects per [`ConflictPolicy`]
//! - **Check-in**: [`ExecutionTicket::checkin`], or dropping the ticket,
//!   clears every slot reachable from the plan's declarations, including
//!   functions the execution never called
//! - **Caching**: [`PlanCache`] keeps compiled copies per query source and
//!   picks a free one, compiling another copy when all are busy
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! use arbor_broker::ShutdownCoordinator;
//! use arbor_common::config::{DatabaseConfig, QueryConfig};
//! use arbor_common::types::Subject;
//! use arbor_xquery::{DynamicContext, XQueryService};
//!
//! let coordinator = ShutdownCoordinator::new();
//! let pool = coordinator
//!     .configure("arbor", 1, 2, DatabaseConfig::for_testing())
//!     .unwrap();
//! let broker = pool.acquire(Subject::guest(), Duration::from_secs(1)).unwrap();
//!
//! let service = XQueryService::new(QueryConfig::default());
//! let result = service
//!     .execute(
//!         &broker,
//!         "declare function local:greet($who) { 'Hello ' || $who }; local:greet('world')",
//!         &DynamicContext::for_broker(&broker),
//!     )
//!     .unwrap();
//! assert_eq!(result.to_string(), "Hello world");
//!
//! // The cached plan is back in its pristine state.
//! assert_eq!(service.cache().len(), 1);
//! drop(broker);
//! coordinator.stop_all(true);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod binding;
pub mod cache;
pub mod checkout;
pub mod error;
pub mod eval;
pub mod parser;
pub mod plan;
pub mod service;
pub mod value;

pub use binding::{BindingTable, FunctionBinding, VariableBinding};
pub use cache::{CacheStats, PlanCache};
pub use checkout::{ConflictPolicy, ExecutionTicket};
pub use error::{XQueryError, XQueryResult};
pub use eval::{CancellationToken, DynamicContext};
pub use parser::XQueryCompiler;
pub use plan::{CompiledPlan, Expr, ExprId, FunctionId, ModuleId, PlanBuilder, VariableId};
pub use service::{QueryCompiler, XQueryService};
pub use value::{FunctionItem, Item, Sequence};
