//! Core domain errors.

use thiserror::Error;

use crate::TaskStatus;

/// Core domain errors for GridRun.
#[derive(Debug, Error, PartialEq)]
pub enum CoreError {
    /// Invalid state transition.
    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition { from: TaskStatus, to: TaskStatus },

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
