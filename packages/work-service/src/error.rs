//! Error types for the invocation scheduler.
//!
//! Version conflicts are deliberately *not* errors: store operations that
//! lose an optimistic-concurrency race report it through their return value
//! (`false` / `None`) and the caller moves on. Only genuine store outages
//! surface as [`StoreError::Unavailable`].

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by an [`InvocationStore`](crate::store::InvocationStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached or the query failed.
    ///
    /// Callers (the runner) log and retry on the next dispatch cycle; a
    /// leased invocation is left untouched and re-dequeues after its lease.
    #[error("invocation store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    /// The referenced invocation row does not exist.
    #[error("invocation {0} not found")]
    NotFound(Uuid),
}

/// Errors raised while binding an invocation payload onto a handler.
///
/// A bind failure is committed as `Crashed` before the handler is invoked.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// A required key was absent (or present with a null value).
    #[error("missing required payload key `{0}`")]
    MissingKey(String),

    /// A value was present but could not be parsed as the target type.
    #[error("payload key `{key}`: cannot parse {value:?} as {expected}")]
    InvalidValue {
        key: String,
        expected: &'static str,
        value: String,
    },
}

/// Errors raised by log capture and the blob store underneath it.
///
/// Capture failures are non-fatal to the dispatch cycle: the log url is
/// left unset and the terminal commit still runs.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("blob store i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("log record serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}
