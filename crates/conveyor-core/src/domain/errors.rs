//! Error types.

use thiserror::Error;

use super::{TaskId, TaskState, WorkerId};

/// Coordinator and store errors.
///
/// `NotOwner` and `InvalidState` are contract violations (a stale claim or a
/// caller bug): they are surfaced to the caller and never retried
/// automatically. `StoreUnavailable` is transient infrastructure failure; the
/// caller retries with backoff.
#[derive(Debug, Error)]
pub enum Error {
    #[error("task {task_id} is not owned by worker {worker_id}")]
    NotOwner { task_id: TaskId, worker_id: WorkerId },

    #[error("task {task_id} is in state {state}, expected {expected}")]
    InvalidState {
        task_id: TaskId,
        state: TaskState,
        expected: &'static str,
    },

    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("payload serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Transient errors are worth retrying by the caller; contract
    /// violations are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::StoreUnavailable(e.to_string())
    }
}

/// Failure raised by a task handler.
///
/// The worker maps `Retriable` to `fail(retriable=true)` (backoff + retry)
/// and `Permanent` (malformed payload, unknown kind, ...) to
/// `fail(retriable=false)` (terminal).
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("retriable: {0}")]
    Retriable(String),

    #[error("permanent: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn retriable(msg: impl Into<String>) -> Self {
        HandlerError::Retriable(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        HandlerError::Permanent(msg.into())
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, HandlerError::Retriable(_))
    }
}
