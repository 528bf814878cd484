//! Reclamation sweep - expires stalled assignments and prunes silent workers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use gridrun_core::{SessionId, TaskId};
use gridrun_proto::ServerMessage;

use crate::coordinator::Coordinator;
use crate::state::{Outbound, SchedulerState};

/// What one sweep tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepSummary {
    /// Expired tasks sent back to PENDING.
    pub requeued: usize,
    /// Expired tasks finalized as TIMEOUT.
    pub timed_out: usize,
    /// Workers removed for missing heartbeats.
    pub pruned: Vec<SessionId>,
    /// Assignments made by the follow-up pass.
    pub assigned: usize,
}

impl SchedulerState {
    /// Expire every held task whose assignment outlived its timeout. The
    /// holder is freed and charged a failure; the task is requeued or, with
    /// no retries left, finalized as TIMEOUT. Returns advisory cancel notices.
    pub fn expire_assignments(&mut self, now: DateTime<Utc>, summary: &mut SweepSummary) -> Vec<Outbound> {
        let mut expired: Vec<(u64, TaskId)> = self
            .tasks
            .values()
            .filter(|t| t.is_expired(now))
            .map(|t| (t.sequence, t.task_id.clone()))
            .collect();
        expired.sort();

        let mut notices = Vec::new();
        for (_, task_id) in expired {
            let Some(task) = self.tasks.get_mut(&task_id) else {
                continue;
            };
            let holder = task.assigned_to.clone();

            let finalized = if task.retries_exhausted() {
                if let Err(e) = task.time_out(now) {
                    warn!(task_id = %task_id, error = %e, "Could not time out task");
                    continue;
                }
                summary.timed_out += 1;
                self.totals.tasks_timed_out += 1;
                warn!(task_id = %task_id, session_id = ?holder, "Task timed out");
                true
            } else {
                if let Err(e) = task.requeue() {
                    warn!(task_id = %task_id, error = %e, "Could not requeue task");
                    continue;
                }
                summary.requeued += 1;
                info!(
                    task_id = %task_id,
                    session_id = ?holder,
                    retry_count = task.retry_count,
                    "Assignment expired, task requeued"
                );
                false
            };

            if let Some(slot) = holder.and_then(|sid| self.workers.get_mut(&sid)) {
                if slot.client.holds(&task_id) {
                    slot.client.release();
                    slot.client.tasks_failed += 1;
                    notices.push(Outbound {
                        session_id: slot.client.session_id.clone(),
                        tx: slot.tx.clone(),
                        message: ServerMessage::cancel(&task_id),
                    });
                }
            }

            if finalized {
                self.settle(&task_id);
            }
        }
        notices
    }

    /// Workers whose last heartbeat is older than `threshold`, in session order.
    pub fn stale_sessions(&self, now: DateTime<Utc>, threshold: Duration) -> Vec<SessionId> {
        let mut stale: Vec<SessionId> = self
            .workers
            .values()
            .filter(|slot| slot.client.is_stale(now, threshold))
            .map(|slot| slot.client.session_id.clone())
            .collect();
        stale.sort();
        stale
    }

    /// One full tick: expire, prune, then reassign freed capacity.
    pub fn sweep(&mut self, now: DateTime<Utc>, heartbeat_timeout: Duration) -> (SweepSummary, Vec<Outbound>) {
        let mut summary = SweepSummary::default();
        let mut outbound = self.expire_assignments(now, &mut summary);

        for session_id in self.stale_sessions(now, heartbeat_timeout) {
            warn!(session_id = %session_id, "Pruning worker with no recent heartbeat");
            if self.unregister_worker(&session_id, now) {
                summary.pruned.push(session_id);
            }
        }
        // Cancel notices for pruned workers have nowhere to go.
        outbound.retain(|o| self.workers.contains_key(&o.session_id));

        let assignments = self.run_assignment_pass(now);
        summary.assigned = assignments.len();
        outbound.extend(assignments);
        (summary, outbound)
    }
}

/// Run [`Coordinator::sweep`] every `sweep_interval` until the task is aborted.
pub fn spawn_sweeper(coordinator: Arc<Coordinator>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(coordinator.config().sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let summary = coordinator.sweep().await;
            if summary != SweepSummary::default() {
                debug!(?summary, "Sweep tick");
            }
        }
    })
}
