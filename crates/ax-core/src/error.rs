use uuid::Uuid;

use crate::types::ExecutionState;

// ---------------------------------------------------------------------------
// ExecutionError
// ---------------------------------------------------------------------------

/// Errors surfaced by the execution lifecycle.
///
/// `NotFound`, `InvalidStateTransition`, `InvalidState` and
/// `ConcurrentModification` are caller-facing and are never retried inside
/// the core. `Upstream` and `Database` describe failures of collaborators.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// The execution id is unknown to the store.
    #[error("execution not found: {0}")]
    NotFound(Uuid),

    /// The requested edge is not part of the lifecycle table.
    #[error("invalid state transition: {current} -> {requested}")]
    InvalidStateTransition {
        current: ExecutionState,
        requested: ExecutionState,
    },

    /// An operation that requires a particular state was attempted from
    /// another one (progress on a paused execution, result submission on a
    /// queued one, ...).
    #[error("cannot {operation} while execution is {current}")]
    InvalidState {
        operation: &'static str,
        current: ExecutionState,
    },

    /// Progress percentage outside `0.0..=100.0`.
    #[error("invalid progress percentage: {0}")]
    InvalidProgress(f64),

    /// The conditional update observed a state other than `expected`;
    /// another writer committed first.
    #[error("concurrent modification of execution {id} (expected state {expected})")]
    ConcurrentModification { id: Uuid, expected: ExecutionState },

    /// The remote execution or human-interaction service failed.
    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<tokio_rusqlite::Error> for ExecutionError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        ExecutionError::Database(err.to_string())
    }
}

impl From<rusqlite::Error> for ExecutionError {
    fn from(err: rusqlite::Error) -> Self {
        ExecutionError::Database(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ExecutionError>;
