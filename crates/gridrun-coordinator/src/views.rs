//! Read-only snapshots returned by the coordinator facade.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use gridrun_core::{ComputeTask, ConnectedClient, Priority, SessionId, TaskId, TaskStatus};

use crate::state::{SchedulerState, Totals};

/// Number of workers listed in `top_contributors`.
pub const TOP_CONTRIBUTORS: usize = 10;

/// Externally visible state of one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatusView {
    pub task_id: TaskId,
    pub task_type: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub assigned_to: Option<SessionId>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub progress: Option<u8>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&ComputeTask> for TaskStatusView {
    fn from(task: &ComputeTask) -> Self {
        Self {
            task_id: task.task_id.clone(),
            task_type: task.task_type.clone(),
            status: task.status,
            priority: task.priority,
            assigned_to: task.assigned_to.clone(),
            result: task.result.clone(),
            error: task.error.clone(),
            progress: task.progress,
            retry_count: task.retry_count,
            created_at: task.created_at,
            completed_at: task.completed_at,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    /// ASSIGNED plus PROCESSING.
    pub processing: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClientStats {
    pub connected: usize,
    pub available: usize,
    pub total_tflops: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contributor {
    pub session_id: SessionId,
    pub gpu_name: String,
    pub credits_earned: f64,
    pub tasks_completed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinatorStats {
    pub queue: QueueStats,
    pub clients: ClientStats,
    pub totals: Totals,
    pub top_contributors: Vec<Contributor>,
}

impl CoordinatorStats {
    pub fn collect(state: &SchedulerState) -> Self {
        let mut queue = QueueStats {
            total: state.tasks.len(),
            ..QueueStats::default()
        };
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Pending => queue.pending += 1,
                TaskStatus::Assigned | TaskStatus::Processing => queue.processing += 1,
                TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Timeout
                | TaskStatus::Cancelled => {}
            }
        }

        let mut clients = ClientStats {
            connected: state.workers.len(),
            ..ClientStats::default()
        };
        for slot in state.workers.values() {
            if slot.client.is_available {
                clients.available += 1;
            }
            clients.total_tflops += slot.client.estimated_tflops.max(0.0);
        }

        let mut ranked: Vec<&ConnectedClient> = state.workers.values().map(|s| &s.client).collect();
        ranked.sort_by(|a, b| {
            b.credits_earned
                .total_cmp(&a.credits_earned)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        let top_contributors = ranked
            .into_iter()
            .take(TOP_CONTRIBUTORS)
            .map(|c| Contributor {
                session_id: c.session_id.clone(),
                gpu_name: c.gpu_name.clone(),
                credits_earned: c.credits_earned,
                tasks_completed: c.tasks_completed,
            })
            .collect();

        Self {
            queue,
            clients,
            totals: state.totals.clone(),
            top_contributors,
        }
    }
}

/// Accounting for one connected worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientCredits {
    pub credits_earned: f64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub total_compute_time: f64,
    pub connected_since: DateTime<Utc>,
}

impl From<&ConnectedClient> for ClientCredits {
    fn from(client: &ConnectedClient) -> Self {
        Self {
            credits_earned: client.credits_earned,
            tasks_completed: client.tasks_completed,
            tasks_failed: client.tasks_failed,
            total_compute_time: client.total_compute_time,
            connected_since: client.connected_at,
        }
    }
}
