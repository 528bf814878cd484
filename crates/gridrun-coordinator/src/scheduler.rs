//! Assignment engine - matches pending tasks to idle workers.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use gridrun_core::{ComputeTask, ConnectedClient, ScoringWeights, SessionId, TaskId, TaskStatus};
use gridrun_proto::ServerMessage;

use crate::state::{Outbound, SchedulerState};

/// Pair pending tasks with available workers for one pass.
///
/// Tasks are walked highest priority first, oldest first within a tier.
/// Workers are ranked by [`ConnectedClient::priority_score`], ties broken by
/// session id. Each worker is proposed at most once per pass; tasks with no
/// capable worker left are simply not in the plan.
pub fn plan_assignments<'a>(
    tasks: impl IntoIterator<Item = &'a ComputeTask>,
    clients: impl IntoIterator<Item = &'a ConnectedClient>,
    now: DateTime<Utc>,
    weights: &ScoringWeights,
) -> Vec<(TaskId, SessionId)> {
    let mut pending: Vec<&ComputeTask> = tasks
        .into_iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .collect();
    if pending.is_empty() {
        return Vec::new();
    }
    pending.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.sequence.cmp(&b.sequence))
    });

    let mut candidates: Vec<(f64, &ConnectedClient)> = clients
        .into_iter()
        .filter(|c| c.is_available)
        .map(|c| (c.priority_score(now, weights), c))
        .collect();
    candidates.sort_by(|(score_a, a), (score_b, b)| {
        score_b
            .total_cmp(score_a)
            .then_with(|| a.session_id.cmp(&b.session_id))
    });

    let mut plan = Vec::new();
    for task in pending {
        if candidates.is_empty() {
            break;
        }
        match candidates.iter().position(|(_, c)| c.can_handle(task)) {
            Some(idx) => {
                let (_, client) = candidates.remove(idx);
                plan.push((task.task_id.clone(), client.session_id.clone()));
            }
            None => {
                debug!(task_id = %task.task_id, model = %task.model_id, "No capable worker available");
            }
        }
    }
    plan
}

impl SchedulerState {
    /// Run one assignment pass and return the `task_assignment` messages to send.
    pub fn run_assignment_pass(&mut self, now: DateTime<Utc>) -> Vec<Outbound> {
        let plan = plan_assignments(
            self.tasks.values(),
            self.workers.values().map(|slot| &slot.client),
            now,
            &self.weights,
        );

        let mut outbound = Vec::with_capacity(plan.len());
        for (task_id, session_id) in plan {
            let (Some(task), Some(slot)) = (
                self.tasks.get_mut(&task_id),
                self.workers.get_mut(&session_id),
            ) else {
                continue;
            };

            if let Err(e) = task.assign(session_id.clone(), now) {
                warn!(task_id = %task_id, error = %e, "Planned assignment rejected");
                continue;
            }
            slot.client.occupy(task_id.clone());

            info!(
                task_id = %task_id,
                session_id = %session_id,
                task_type = %task.task_type,
                priority = ?task.priority,
                retry_count = task.retry_count,
                "Assigning task to worker"
            );

            outbound.push(Outbound {
                session_id,
                tx: slot.tx.clone(),
                message: ServerMessage::assignment(task),
            });
        }
        outbound
    }
}
