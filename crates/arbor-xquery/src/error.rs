//! Error types for query compilation and execution.

use arbor_broker::BrokerError;
use arbor_common::types::PlanId;
use thiserror::Error;

/// Query errors.
#[derive(Debug, Error)]
pub enum XQueryError {
    /// The plan is checked out by another execution.
    #[error("{0} is checked out by another execution")]
    PlanCheckoutConflict(PlanId),

    /// The plan was not checked in within the wait limit.
    #[error("timed out after {timeout_ms}ms waiting for {plan}")]
    CheckoutTimeout {
        /// The busy plan.
        plan: PlanId,
        /// The wait limit that elapsed.
        timeout_ms: u64,
    },

    /// The query source could not be compiled.
    #[error("compile error at {line}:{column}: {message}")]
    Compile {
        /// 1-based line.
        line: usize,
        /// 1-based column.
        column: usize,
        /// What went wrong.
        message: String,
    },

    /// The plan is well-formed syntactically but inconsistent, for example
    /// a function declared twice.
    #[error("static error: {0}")]
    Static(String),

    /// Reference to a variable that is neither in scope nor declared.
    #[error("undeclared variable ${0}")]
    UnknownVariable(String),

    /// Call to a function that is not declared with that arity.
    #[error("unknown function {name}#{arity}")]
    UnknownFunction {
        /// Function name as written.
        name: String,
        /// Number of arguments in the call.
        arity: usize,
    },

    /// A value had the wrong type for the operation.
    #[error("type error: {0}")]
    Type(String),

    /// A function was called with the wrong number of arguments.
    #[error("{function} expects {expected} argument(s), got {found}")]
    ArityMismatch {
        /// Function name.
        function: String,
        /// Declared arity.
        expected: usize,
        /// Arguments supplied.
        found: usize,
    },

    /// Nested calls went deeper than the evaluator allows.
    #[error("call depth exceeded {0}")]
    RecursionLimit(usize),

    /// The execution was cancelled by its caller.
    #[error("query cancelled")]
    Cancelled,

    /// The execution ran past its deadline.
    #[error("query exceeded its {timeout_ms}ms time limit")]
    Timeout {
        /// The time limit.
        timeout_ms: u64,
    },

    /// A broker operation failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl XQueryError {
    pub(crate) fn compile(line: usize, column: usize, message: impl Into<String>) -> Self {
        XQueryError::Compile {
            line,
            column,
            message: message.into(),
        }
    }

    /// Returns true for errors a caller may resolve by retrying later.
    pub fn is_retryable(&self) -> bool {
        match self {
            XQueryError::PlanCheckoutConflict(_) | XQueryError::CheckoutTimeout { .. } => true,
            XQueryError::Broker(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Result type for query operations.
pub type XQueryResult<T> = Result<T, XQueryError>;
