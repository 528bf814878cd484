//! Status and priority enums for compute tasks.

use serde::{Deserialize, Serialize};

/// Scheduling tier of a task. Declaration order is the ordering used by the
/// assignment engine: `Low < Normal < High < Urgent`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// Status of a ComputeTask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting in the queue for a capable, idle worker.
    #[default]
    Pending,
    /// Handed to a worker, no progress reported yet.
    Assigned,
    /// Worker reported progress.
    Processing,
    /// Worker reported success.
    Completed,
    /// Worker reported failure, or the task could not be retried after a disconnect.
    Failed,
    /// Assignment expired with no retries left.
    Timeout,
    /// Cancelled by the submitter.
    Cancelled,
}

impl TaskStatus {
    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }

    /// Returns true if a worker currently holds the task.
    pub fn is_held(&self) -> bool {
        matches!(self, Self::Assigned | Self::Processing)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Assigned) | (Pending, Cancelled) => true,
            (Assigned, Processing) => true,
            (Assigned | Processing, Pending) => true,
            (Assigned | Processing, Completed | Failed | Timeout | Cancelled) => true,
            _ => false,
        }
    }
}
