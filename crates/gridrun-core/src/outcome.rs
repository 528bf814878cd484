//! Terminal outcome delivered to completion listeners.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::TaskStatus;

/// How a task ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// Worker reported success with this payload.
    Completed { result: Value },
    /// Task ended in FAILED, TIMEOUT or CANCELLED.
    Failed { status: TaskStatus, error: String },
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}
