//! Shared scheduling state.
//!
//! Every method here runs under the coordinator's single state lock, so one
//! logical operation (registration, assignment pass, result report, sweep
//! tick) is never interleaved with another. Nothing in this module touches a
//! socket: messages for workers are returned as [`Outbound`] values and sent
//! after the lock is released.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use gridrun_core::{
    ComputeTask, ConnectedClient, CreditTable, ScoringWeights, SessionId, TaskId, TaskOutcome,
};
use gridrun_proto::ServerMessage;

use crate::error::CoordinatorError;

/// A registered worker and the channel feeding its connection.
pub struct WorkerSlot {
    pub client: ConnectedClient,

    /// Channel to the connection's send loop.
    pub tx: mpsc::Sender<ServerMessage>,

    /// Fired (or dropped) when the worker leaves the registry, so the
    /// connection that owns it closes too.
    evict: oneshot::Sender<()>,
}

/// A message queued for one worker connection.
#[derive(Debug)]
pub struct Outbound {
    pub session_id: SessionId,
    pub tx: mpsc::Sender<ServerMessage>,
    pub message: ServerMessage,
}

/// Lifetime counters. They survive worker disconnects.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Totals {
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_timed_out: u64,
    pub tasks_cancelled: u64,
    pub credits_awarded: f64,
    pub total_compute_time: f64,
}

/// A `task_result` frame after transport decoding.
#[derive(Debug, Clone)]
pub struct ResultReport {
    pub session_id: SessionId,
    pub task_id: TaskId,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Seconds of compute claimed by the worker.
    pub compute_time: f64,
}

/// Task record store plus worker registry.
pub struct SchedulerState {
    pub tasks: HashMap<TaskId, ComputeTask>,

    pub workers: HashMap<SessionId, WorkerSlot>,

    /// One-shot completion listeners, resolved on the first terminal status.
    completions: HashMap<TaskId, oneshot::Sender<TaskOutcome>>,

    pub totals: Totals,

    credits: CreditTable,

    pub(crate) weights: ScoringWeights,

    next_sequence: u64,
}

impl SchedulerState {
    pub fn new(credits: CreditTable, weights: ScoringWeights) -> Self {
        Self {
            tasks: HashMap::new(),
            workers: HashMap::new(),
            completions: HashMap::new(),
            totals: Totals::default(),
            credits,
            weights,
            next_sequence: 0,
        }
    }

    /// Store a PENDING task and stamp its submission order.
    pub fn insert_task(
        &mut self,
        mut task: ComputeTask,
        listener: Option<oneshot::Sender<TaskOutcome>>,
    ) -> TaskId {
        task.sequence = self.next_sequence;
        self.next_sequence += 1;
        self.totals.tasks_submitted += 1;

        let task_id = task.task_id.clone();
        if let Some(listener) = listener {
            self.completions.insert(task_id.clone(), listener);
        }
        self.tasks.insert(task_id.clone(), task);
        task_id
    }

    /// Keep a requested session id if it is not live, otherwise issue a fresh one.
    pub fn resolve_session_id(&self, requested: Option<&str>) -> SessionId {
        match requested.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) if !self.workers.contains_key(&SessionId::from(id)) => SessionId::from(id),
            _ => SessionId::generate(),
        }
    }

    /// Insert a worker and queue its `worker_registered` acknowledgement.
    /// The returned receiver resolves once the worker is removed again.
    pub fn register_worker(
        &mut self,
        client: ConnectedClient,
        tx: mpsc::Sender<ServerMessage>,
    ) -> (Outbound, oneshot::Receiver<()>) {
        let session_id = client.session_id.clone();
        let message = ServerMessage::WorkerRegistered((&client).into());
        let (evict, evicted) = oneshot::channel();
        self.workers.insert(
            session_id.clone(),
            WorkerSlot {
                client,
                tx: tx.clone(),
                evict,
            },
        );
        let ack = Outbound {
            session_id,
            tx,
            message,
        };
        (ack, evicted)
    }

    /// Remove a worker. A task it held goes back to PENDING, or to FAILED
    /// once its retries are spent. The worker's failure count is untouched.
    pub fn unregister_worker(&mut self, session_id: &SessionId, now: DateTime<Utc>) -> bool {
        let Some(slot) = self.workers.remove(session_id) else {
            return false;
        };
        let WorkerSlot { client, evict, .. } = slot;
        // The connection may already be gone.
        let _ = evict.send(());

        if let Some(task_id) = client.current_task {
            self.reclaim_after_disconnect(&task_id, session_id, now);
        }
        true
    }

    /// Remove a worker only if it is still registered through `tx`. A
    /// connection whose session was pruned and then resumed elsewhere must
    /// not remove the new owner.
    pub fn unregister_connection(
        &mut self,
        session_id: &SessionId,
        tx: &mpsc::Sender<ServerMessage>,
        now: DateTime<Utc>,
    ) -> bool {
        match self.workers.get(session_id) {
            Some(slot) if slot.tx.same_channel(tx) => self.unregister_worker(session_id, now),
            _ => false,
        }
    }

    fn reclaim_after_disconnect(&mut self, task_id: &TaskId, session_id: &SessionId, now: DateTime<Utc>) {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return;
        };
        if !task.is_held_by(session_id) {
            return;
        }

        if task.retries_exhausted() {
            if task.fail("Worker disconnected and no retries remain", now).is_ok() {
                self.totals.tasks_failed += 1;
                warn!(task_id = %task_id, session_id = %session_id, "Task failed after worker disconnect");
                self.settle(task_id);
            }
        } else if task.requeue().is_ok() {
            info!(
                task_id = %task_id,
                session_id = %session_id,
                retry_count = task.retry_count,
                "Task requeued after worker disconnect"
            );
        }
    }

    /// Record a heartbeat. Returns false for unknown sessions.
    pub fn heartbeat(&mut self, session_id: &SessionId, now: DateTime<Utc>) -> bool {
        match self.workers.get_mut(session_id) {
            Some(slot) => {
                slot.client.last_heartbeat = now;
                true
            }
            None => false,
        }
    }

    /// Replace the worker's declared model set.
    pub fn update_models(&mut self, session_id: &SessionId, models: Vec<String>) -> bool {
        match self.workers.get_mut(session_id) {
            Some(slot) => {
                slot.client.supported_models = models.into_iter().collect();
                true
            }
            None => false,
        }
    }

    /// Apply a progress report from the task's owner.
    pub fn record_progress(&mut self, session_id: &SessionId, task_id: &TaskId, progress: u8) -> bool {
        let Some(task) = self.tasks.get_mut(task_id) else {
            warn!(task_id = %task_id, "Progress for unknown task");
            return false;
        };
        if !task.is_held_by(session_id) {
            warn!(task_id = %task_id, session_id = %session_id, "Progress from non-owning worker ignored");
            return false;
        }
        match task.record_progress(progress) {
            Ok(()) => {
                debug!(task_id = %task_id, progress, "Task progress");
                true
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Progress rejected");
                false
            }
        }
    }

    /// Apply a worker's result. Returns false (and changes nothing) when the
    /// task or worker is unknown, the reporter does not own the task, or the
    /// task is already terminal.
    pub fn apply_result(&mut self, report: &ResultReport, now: DateTime<Utc>) -> bool {
        let (Some(task), Some(slot)) = (
            self.tasks.get_mut(&report.task_id),
            self.workers.get_mut(&report.session_id),
        ) else {
            warn!(
                task_id = %report.task_id,
                session_id = %report.session_id,
                "Result for unknown task or worker dropped"
            );
            return false;
        };

        if task.assigned_to.as_ref() != Some(&report.session_id) {
            warn!(
                task_id = %report.task_id,
                session_id = %report.session_id,
                owner = ?task.assigned_to,
                "Result from non-owning worker dropped"
            );
            return false;
        }
        if task.is_terminal() || !slot.client.holds(&report.task_id) {
            debug!(
                task_id = %report.task_id,
                status = ?task.status,
                "Late result for finalized task dropped"
            );
            return false;
        }

        let applied = if report.success {
            task.complete(report.result.clone().unwrap_or(Value::Null), now)
        } else {
            let error = report
                .error
                .clone()
                .unwrap_or_else(|| "Worker reported failure".to_string());
            task.fail(error, now)
        };
        if let Err(e) = applied {
            warn!(task_id = %report.task_id, error = %e, "Result rejected");
            return false;
        }

        let compute_time = if report.compute_time.is_finite() {
            report.compute_time.max(0.0)
        } else {
            0.0
        };

        let client = &mut slot.client;
        client.release();
        client.total_compute_time += compute_time;
        self.totals.total_compute_time += compute_time;

        if report.success {
            let credits = self.credits.credits_for(&task.task_type);
            client.credits_earned += credits;
            client.tasks_completed += 1;
            self.totals.tasks_completed += 1;
            self.totals.credits_awarded += credits;
            info!(
                task_id = %report.task_id,
                session_id = %report.session_id,
                credits,
                compute_time,
                "Task completed"
            );
        } else {
            client.tasks_failed += 1;
            self.totals.tasks_failed += 1;
            info!(
                task_id = %report.task_id,
                session_id = %report.session_id,
                error = ?task.error,
                "Task failed"
            );
        }

        self.settle(&report.task_id);
        true
    }

    /// Cancel a task. Returns `Ok(false)` if it is already terminal, and the
    /// advisory cancel notice for its worker if one held it.
    pub fn cancel_task(
        &mut self,
        task_id: &TaskId,
        now: DateTime<Utc>,
    ) -> Result<(bool, Option<Outbound>), CoordinatorError> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| CoordinatorError::TaskNotFound(task_id.clone()))?;

        if task.is_terminal() {
            return Ok((false, None));
        }

        let holder = task
            .status
            .is_held()
            .then(|| task.assigned_to.clone())
            .flatten();
        task.cancel(now)?;
        self.totals.tasks_cancelled += 1;

        // Freeing the worker is not a failure on its record.
        let notice = holder.and_then(|session_id| {
            let slot = self.workers.get_mut(&session_id)?;
            if !slot.client.holds(task_id) {
                return None;
            }
            slot.client.release();
            Some(Outbound {
                session_id,
                tx: slot.tx.clone(),
                message: ServerMessage::cancel(task_id),
            })
        });

        info!(task_id = %task_id, notified = notice.is_some(), "Task cancelled");
        self.settle(task_id);
        Ok((true, notice))
    }

    /// Resolve the completion listener, at most once.
    pub(crate) fn settle(&mut self, task_id: &TaskId) {
        let Some(listener) = self.completions.remove(task_id) else {
            return;
        };
        if let Some(outcome) = self.tasks.get(task_id).and_then(ComputeTask::outcome) {
            // The submitter may have dropped its receiver.
            let _ = listener.send(outcome);
        }
    }

    /// Check the task/worker cross-references.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) -> Result<(), String> {
        for task in self.tasks.values() {
            if task.status.is_held() {
                let owner = task
                    .assigned_to
                    .as_ref()
                    .ok_or_else(|| format!("{} held without owner", task.task_id))?;
                let slot = self
                    .workers
                    .get(owner)
                    .ok_or_else(|| format!("{} held by unregistered {}", task.task_id, owner))?;
                if !slot.client.holds(&task.task_id) {
                    return Err(format!("{} not recorded on {}", task.task_id, owner));
                }
            }
            if task.retry_count > task.max_retries {
                return Err(format!("{} exceeded its retry budget", task.task_id));
            }
        }
        for slot in self.workers.values() {
            let client = &slot.client;
            if client.is_available == client.current_task.is_some() {
                return Err(format!("{} availability flag is inconsistent", client.session_id));
            }
            if let Some(task_id) = &client.current_task {
                let held = self
                    .tasks
                    .get(task_id)
                    .map(|t| t.is_held_by(&client.session_id))
                    .unwrap_or(false);
                if !held {
                    return Err(format!("{} holds stale task {}", client.session_id, task_id));
                }
            }
        }
        Ok(())
    }
}
