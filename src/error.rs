//! Error types for avflow.

use thiserror::Error;

/// Result type alias using avflow's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for avflow operations.
///
/// The enum is `Clone` so the first failure observed in a filter subtree can
/// be stored on the filter and later surfaced by `wait_all_state`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Lifecycle call attempted from an incompatible state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Bad argument (missing registration, empty link set, out-of-range id).
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Transient busy condition; the caller may retry shortly.
    #[error("resource temporarily busy, try again")]
    Again,

    /// A bounded wait expired before the target condition was reached.
    #[error("operation timed out")]
    TimedOut,

    /// Queue or pool was deactivated while an operation was in flight.
    #[error("container is inactive")]
    Inactive,

    /// Buffer pool has no free buffers.
    #[error("buffer pool exhausted: no buffers available")]
    PoolExhausted,

    /// A codec or I/O plugin call failed.
    #[error("plugin failure: {0}")]
    Plugin(String),

    /// No generator registered for the requested filter type.
    #[error("filter type not registered: {0}")]
    NotRegistered(String),
}

impl Error {
    /// Shorthand for an invalid-operation error with context.
    pub fn invalid_op(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    /// True for conditions worth a bounded local retry (codec busy).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Again | Self::TimedOut)
    }
}
