//! Coordinator errors surfaced to task producers.

use std::time::Duration;

use thiserror::Error;

use gridrun_core::{CoreError, SessionId, TaskId, TaskStatus};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Client not found: {0}")]
    ClientNotFound(SessionId),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The task ended in FAILED, TIMEOUT or CANCELLED.
    #[error("Task {task_id} ended as {status:?}: {error}")]
    TaskFailed {
        task_id: TaskId,
        status: TaskStatus,
        error: String,
    },

    /// The caller's own wait elapsed. The task itself may still finish.
    #[error("Timed out after {waited:?} waiting for task {task_id}")]
    WaitTimeout { task_id: TaskId, waited: Duration },
}

impl From<CoreError> for CoordinatorError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidInput(msg) => Self::InvalidInput(msg),
            other => Self::InvalidInput(other.to_string()),
        }
    }
}
