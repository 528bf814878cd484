//! The ComputeTask record and its status transitions.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{CoreError, Priority, SessionId, TaskId, TaskOutcome, TaskStatus};

/// Default per-assignment timeout.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 60;

/// Default number of requeues before a task is finalized.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Upper bound on `timeout_seconds` (30 days).
pub const MAX_TIMEOUT_SECONDS: u64 = 30 * 24 * 60 * 60;

/// One unit of work submitted for distributed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeTask {
    /// Unique task identifier.
    pub task_id: TaskId,

    /// Tag used for credit lookup.
    pub task_type: String,

    /// Opaque payload forwarded to the worker.
    pub input_data: Value,

    /// Model the worker must declare support for.
    pub model_id: String,

    pub priority: Priority,

    pub status: TaskStatus,

    /// Worker that holds (or last held) the task.
    pub assigned_to: Option<SessionId>,

    pub assigned_at: Option<DateTime<Utc>>,

    pub completed_at: Option<DateTime<Utc>>,

    /// Success payload. Mutually exclusive with `error`.
    pub result: Option<Value>,

    pub error: Option<String>,

    /// Last progress percentage reported by the worker.
    pub progress: Option<u8>,

    pub created_at: DateTime<Utc>,

    pub timeout_seconds: u64,

    pub retry_count: u32,

    pub max_retries: u32,

    /// Submission order, used to keep FIFO within a priority tier when
    /// `created_at` values collide.
    pub sequence: u64,
}

impl ComputeTask {
    /// Create a new PENDING task with default scheduling metadata.
    pub fn new(task_type: impl Into<String>, input_data: Value, model_id: impl Into<String>) -> Self {
        Self {
            task_id: TaskId::generate(),
            task_type: task_type.into(),
            input_data,
            model_id: model_id.into(),
            priority: Priority::Normal,
            status: TaskStatus::Pending,
            assigned_to: None,
            assigned_at: None,
            completed_at: None,
            result: None,
            error: None,
            progress: None,
            created_at: Utc::now(),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            sequence: 0,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Check submission-time constraints.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.task_type.trim().is_empty() {
            return Err(CoreError::InvalidInput("task_type must not be empty".into()));
        }
        if self.timeout_seconds == 0 {
            return Err(CoreError::InvalidInput(
                "timeout_seconds must be greater than zero".into(),
            ));
        }
        if self.timeout_seconds > MAX_TIMEOUT_SECONDS {
            return Err(CoreError::InvalidInput(format!(
                "timeout_seconds must be at most {MAX_TIMEOUT_SECONDS}"
            )));
        }
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// True if `session_id` currently holds this task.
    pub fn is_held_by(&self, session_id: &SessionId) -> bool {
        self.status.is_held() && self.assigned_to.as_ref() == Some(session_id)
    }

    /// True if the assignment has outlived `timeout_seconds` at `now`.
    /// A timeout too large to represent never expires.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let (true, Some(at)) = (self.status.is_held(), self.assigned_at) else {
            return false;
        };
        let Some(limit) = i64::try_from(self.timeout_seconds)
            .ok()
            .and_then(Duration::try_seconds)
        else {
            return false;
        };
        now.signed_duration_since(at) > limit
    }

    /// True once the retry budget is spent.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    fn transition(&mut self, next: TaskStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidStateTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// PENDING -> ASSIGNED.
    pub fn assign(&mut self, session_id: SessionId, now: DateTime<Utc>) -> Result<(), CoreError> {
        self.transition(TaskStatus::Assigned)?;
        self.assigned_to = Some(session_id);
        self.assigned_at = Some(now);
        self.progress = None;
        Ok(())
    }

    /// Record a progress report. ASSIGNED moves to PROCESSING; PROCESSING
    /// just updates the percentage.
    pub fn record_progress(&mut self, progress: u8) -> Result<(), CoreError> {
        match self.status {
            TaskStatus::Assigned => self.transition(TaskStatus::Processing)?,
            TaskStatus::Processing => {}
            other => {
                return Err(CoreError::InvalidStateTransition {
                    from: other,
                    to: TaskStatus::Processing,
                })
            }
        }
        self.progress = Some(progress.min(100));
        Ok(())
    }

    /// ASSIGNED/PROCESSING -> PENDING, consuming one retry.
    pub fn requeue(&mut self) -> Result<(), CoreError> {
        self.transition(TaskStatus::Pending)?;
        self.retry_count += 1;
        self.assigned_to = None;
        self.assigned_at = None;
        self.progress = None;
        Ok(())
    }

    pub fn complete(&mut self, result: Value, now: DateTime<Utc>) -> Result<(), CoreError> {
        self.transition(TaskStatus::Completed)?;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<(), CoreError> {
        self.finish(TaskStatus::Failed, error.into(), now)
    }

    pub fn time_out(&mut self, now: DateTime<Utc>) -> Result<(), CoreError> {
        let error = format!(
            "Task timed out after {} attempt(s) of {}s",
            self.retry_count + 1,
            self.timeout_seconds
        );
        self.finish(TaskStatus::Timeout, error, now)
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), CoreError> {
        self.finish(TaskStatus::Cancelled, "Task was cancelled".to_string(), now)
    }

    fn finish(&mut self, status: TaskStatus, error: String, now: DateTime<Utc>) -> Result<(), CoreError> {
        self.transition(status)?;
        self.result = None;
        self.error = Some(error);
        self.completed_at = Some(now);
        Ok(())
    }

    /// The terminal outcome, if the task has one.
    pub fn outcome(&self) -> Option<TaskOutcome> {
        match self.status {
            TaskStatus::Completed => Some(TaskOutcome::Completed {
                result: self.result.clone().unwrap_or(Value::Null),
            }),
            status if status.is_terminal() => Some(TaskOutcome::Failed {
                status,
                error: self.error.clone().unwrap_or_default(),
            }),
            _ => None,
        }
    }
}
