//! Error types for task waits.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for task waits.
pub type TaskResult<T> = Result<T, TaskError>;

/// Reasons a wait on a task did not yield a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task was cancelled")]
    Cancelled,

    #[error("task did not complete within {0:?}")]
    Timeout(Duration),
}
