//! Connected worker record and capability queries.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{ComputeTask, ScoringWeights, SessionId, TaskId};

/// One live worker connection and its declared capabilities/stats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectedClient {
    pub session_id: SessionId,

    /// Hardware/transport tier, informational only.
    pub capability: String,

    pub gpu_name: String,

    /// Self-reported capacity. Only feeds the score.
    pub estimated_tflops: f64,

    /// True iff the worker holds no task.
    pub is_available: bool,

    pub current_task: Option<TaskId>,

    pub last_heartbeat: DateTime<Utc>,

    pub connected_at: DateTime<Utc>,

    pub tasks_completed: u64,

    pub tasks_failed: u64,

    /// Seconds of compute reported by the worker across all results.
    pub total_compute_time: f64,

    pub credits_earned: f64,

    /// Model ids this worker can run.
    pub supported_models: BTreeSet<String>,
}

impl ConnectedClient {
    /// Create an idle client that just connected at `now`.
    pub fn new(session_id: SessionId, now: DateTime<Utc>) -> Self {
        Self {
            session_id,
            capability: "unknown".to_string(),
            gpu_name: String::new(),
            estimated_tflops: 0.0,
            is_available: true,
            current_task: None,
            last_heartbeat: now,
            connected_at: now,
            tasks_completed: 0,
            tasks_failed: 0,
            total_compute_time: 0.0,
            credits_earned: 0.0,
            supported_models: BTreeSet::new(),
        }
    }

    /// Builder method to declare a supported model.
    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.supported_models.insert(model_id.into());
        self
    }

    pub fn with_tflops(mut self, tflops: f64) -> Self {
        self.estimated_tflops = tflops;
        self
    }

    /// Idle and declares the task's model. No implicit fallback.
    pub fn can_handle(&self, task: &ComputeTask) -> bool {
        self.is_available && self.supported_models.contains(&task.model_id)
    }

    /// `completed / (completed + failed)`, or 0.0 with no history.
    pub fn success_ratio(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_failed;
        if total == 0 {
            0.0
        } else {
            self.tasks_completed as f64 / total as f64
        }
    }

    /// Ranking heuristic for the assignment engine; higher is better.
    pub fn priority_score(&self, now: DateTime<Utc>, weights: &ScoringWeights) -> f64 {
        let mut score = self.estimated_tflops.max(0.0) * weights.tflops_weight
            + self.success_ratio() * weights.success_weight;

        let window = Duration::from_std(weights.recency_window).unwrap_or(Duration::zero());
        if now - self.last_heartbeat <= window {
            score += weights.recency_bonus;
        }
        score
    }

    /// Take ownership of a task.
    pub fn occupy(&mut self, task_id: TaskId) {
        self.is_available = false;
        self.current_task = Some(task_id);
    }

    /// Return to the idle pool.
    pub fn release(&mut self) {
        self.is_available = true;
        self.current_task = None;
    }

    pub fn holds(&self, task_id: &TaskId) -> bool {
        self.current_task.as_ref() == Some(task_id)
    }

    /// No heartbeat within `threshold` of `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: std::time::Duration) -> bool {
        let threshold =
            Duration::from_std(threshold).unwrap_or_else(|_| Duration::days(365 * 100));
        now - self.last_heartbeat > threshold
    }
}
