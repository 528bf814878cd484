//! Coordinator facade - the public API for task producers and the
//! transport layer.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use gridrun_core::{
    ComputeTask, ConnectedClient, Priority, SessionId, TaskId, TaskOutcome, TaskStatus,
};
use gridrun_proto::ServerMessage;

use crate::config::Config;
use crate::error::CoordinatorError;
use crate::reclaim::SweepSummary;
use crate::state::{Outbound, ResultReport, SchedulerState};
use crate::views::{ClientCredits, CoordinatorStats, TaskStatusView};

/// Parameters for [`Coordinator::submit_task`].
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub task_type: String,
    pub input_data: Value,
    pub model_id: String,
    pub priority: Priority,
    /// Falls back to `Config::default_timeout_seconds`.
    pub timeout_seconds: Option<u64>,
    /// Falls back to `Config::default_max_retries`.
    pub max_retries: Option<u32>,
}

impl TaskRequest {
    pub fn new(task_type: impl Into<String>, input_data: Value, model_id: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            input_data,
            model_id: model_id.into(),
            priority: Priority::Normal,
            timeout_seconds: None,
            max_retries: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Parameters for [`Coordinator::submit_batch_task`].
#[derive(Debug, Clone)]
pub struct BatchRequest {
    /// Base type; each chunk is submitted as `"{task_type}_batch"`.
    pub task_type: String,
    pub items: Vec<Value>,
    pub model_id: String,
    pub batch_size: usize,
    pub priority: Priority,
    pub timeout_seconds: Option<u64>,
}

impl BatchRequest {
    pub fn new(
        task_type: impl Into<String>,
        items: Vec<Value>,
        model_id: impl Into<String>,
        batch_size: usize,
    ) -> Self {
        Self {
            task_type: task_type.into(),
            items,
            model_id: model_id.into(),
            batch_size,
            priority: Priority::Normal,
            timeout_seconds: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Worker metadata gathered from the connection handshake and the
/// `register` frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientRegistration {
    /// Session the worker asks to resume.
    pub session_id: Option<String>,
    pub capability: Option<String>,
    pub gpu_name: Option<String>,
    pub estimated_tflops: Option<f64>,
    pub supported_models: Vec<String>,
}

impl ClientRegistration {
    fn into_client(self, session_id: SessionId, now: DateTime<Utc>) -> ConnectedClient {
        let mut client = ConnectedClient::new(session_id, now);
        if let Some(capability) = self.capability {
            client.capability = capability;
        }
        if let Some(gpu_name) = self.gpu_name {
            client.gpu_name = gpu_name;
        }
        if let Some(tflops) = self.estimated_tflops.filter(|t| t.is_finite()) {
            client.estimated_tflops = tflops.max(0.0);
        }
        client.supported_models = self.supported_models.into_iter().collect();
        client
    }
}

/// A successful registration.
#[derive(Debug)]
pub struct ClientLease {
    pub session_id: SessionId,
    /// Resolves when the coordinator drops the worker (pruned, send
    /// failure, or unregistered elsewhere). The connection should close.
    pub evicted: oneshot::Receiver<()>,
}

/// Owns the scheduling state. Every state-changing call takes the state lock
/// for the whole logical operation and runs an assignment pass before
/// releasing it; messages for workers are sent after the lock is dropped.
pub struct Coordinator {
    config: Config,
    state: Mutex<SchedulerState>,
    /// Woken after every state change; result waiters park on it.
    changed: Notify,
}

impl Coordinator {
    /// Create a new Coordinator wrapped in Arc.
    pub fn new(config: Config) -> Arc<Self> {
        let state = SchedulerState::new(config.credits.clone(), config.scoring.clone());
        Arc::new(Self {
            config,
            state: Mutex::new(state),
            changed: Notify::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn build_task(
        &self,
        task_type: String,
        input_data: Value,
        model_id: String,
        priority: Priority,
        timeout_seconds: Option<u64>,
        max_retries: Option<u32>,
    ) -> Result<ComputeTask, CoordinatorError> {
        let task = ComputeTask::new(task_type, input_data, model_id)
            .with_priority(priority)
            .with_timeout(timeout_seconds.unwrap_or(self.config.default_timeout_seconds))
            .with_max_retries(max_retries.unwrap_or(self.config.default_max_retries));
        task.validate()?;
        Ok(task)
    }

    /// Queue a task and attempt assignment immediately.
    pub async fn submit_task(&self, request: TaskRequest) -> Result<TaskId, CoordinatorError> {
        self.submit(request, None).await
    }

    /// Like [`submit_task`](Self::submit_task), plus a receiver that resolves
    /// once with the task's terminal outcome.
    pub async fn submit_task_with_completion(
        &self,
        request: TaskRequest,
    ) -> Result<(TaskId, oneshot::Receiver<TaskOutcome>), CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        let task_id = self.submit(request, Some(tx)).await?;
        Ok((task_id, rx))
    }

    async fn submit(
        &self,
        request: TaskRequest,
        listener: Option<oneshot::Sender<TaskOutcome>>,
    ) -> Result<TaskId, CoordinatorError> {
        let task = self.build_task(
            request.task_type,
            request.input_data,
            request.model_id,
            request.priority,
            request.timeout_seconds,
            request.max_retries,
        )?;

        let now = Utc::now();
        let (task_id, outbound) = {
            let mut state = self.state.lock().await;
            let task_id = state.insert_task(task, listener);
            info!(
                task_id = %task_id,
                task_type = %state.tasks[&task_id].task_type,
                model = %state.tasks[&task_id].model_id,
                "Task submitted"
            );
            (task_id, state.run_assignment_pass(now))
        };

        self.dispatch(outbound).await;
        self.changed.notify_waiters();
        Ok(task_id)
    }

    /// Split `items` into chunks of `batch_size` and submit one task per
    /// chunk. Ids are returned in chunk order.
    pub async fn submit_batch_task(&self, request: BatchRequest) -> Result<Vec<TaskId>, CoordinatorError> {
        if request.batch_size == 0 {
            return Err(CoordinatorError::InvalidInput(
                "batch_size must be greater than zero".into(),
            ));
        }

        let task_type = format!("{}_batch", request.task_type);
        let tasks = request
            .items
            .chunks(request.batch_size)
            .map(|chunk| {
                self.build_task(
                    task_type.clone(),
                    Value::Array(chunk.to_vec()),
                    request.model_id.clone(),
                    request.priority,
                    request.timeout_seconds,
                    None,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let now = Utc::now();
        let (task_ids, outbound) = {
            let mut state = self.state.lock().await;
            let ids: Vec<TaskId> = tasks
                .into_iter()
                .map(|task| state.insert_task(task, None))
                .collect();
            info!(
                task_type = %task_type,
                items = request.items.len(),
                batches = ids.len(),
                "Batch submitted"
            );
            (ids, state.run_assignment_pass(now))
        };

        self.dispatch(outbound).await;
        self.changed.notify_waiters();
        Ok(task_ids)
    }

    pub async fn get_task_status(&self, task_id: &TaskId) -> Option<TaskStatusView> {
        self.state.lock().await.tasks.get(task_id).map(TaskStatusView::from)
    }

    /// Fetch a task's result.
    ///
    /// Without `wait`, returns the result if the task has COMPLETED and `None`
    /// otherwise. With `wait`, parks until the task is terminal or `timeout`
    /// elapses: COMPLETED yields the result, any other terminal status yields
    /// [`CoordinatorError::TaskFailed`], and the deadline yields
    /// [`CoordinatorError::WaitTimeout`].
    pub async fn get_task_result(
        &self,
        task_id: &TaskId,
        wait: bool,
        timeout: Duration,
    ) -> Result<Option<Value>, CoordinatorError> {
        if !wait {
            let state = self.state.lock().await;
            let task = state
                .tasks
                .get(task_id)
                .ok_or_else(|| CoordinatorError::TaskNotFound(task_id.clone()))?;
            return Ok(match task.status {
                TaskStatus::Completed => task.result.clone(),
                _ => None,
            });
        }

        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before looking, so a change between the
            // check and the wait is not missed.
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let outcome = {
                let state = self.state.lock().await;
                state
                    .tasks
                    .get(task_id)
                    .ok_or_else(|| CoordinatorError::TaskNotFound(task_id.clone()))?
                    .outcome()
            };
            match outcome {
                Some(TaskOutcome::Completed { result }) => return Ok(Some(result)),
                Some(TaskOutcome::Failed { status, error }) => {
                    return Err(CoordinatorError::TaskFailed {
                        task_id: task_id.clone(),
                        status,
                        error,
                    })
                }
                None => {}
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(CoordinatorError::WaitTimeout {
                    task_id: task_id.clone(),
                    waited: timeout,
                });
            }
        }
    }

    /// Cancel a task. Returns `Ok(false)` if it already finished.
    ///
    /// Returns once bookkeeping is updated. A worker holding the task gets a
    /// best-effort `cancel_task` notice and may keep running; its eventual
    /// result is dropped.
    pub async fn cancel_task(&self, task_id: &TaskId) -> Result<bool, CoordinatorError> {
        let now = Utc::now();
        let (cancelled, outbound) = {
            let mut state = self.state.lock().await;
            let (cancelled, notice) = state.cancel_task(task_id, now)?;
            let mut outbound: Vec<Outbound> = notice.into_iter().collect();
            if cancelled {
                outbound.extend(state.run_assignment_pass(now));
            }
            (cancelled, outbound)
        };

        self.dispatch(outbound).await;
        self.changed.notify_waiters();
        Ok(cancelled)
    }

    pub async fn get_stats(&self) -> CoordinatorStats {
        CoordinatorStats::collect(&*self.state.lock().await)
    }

    pub async fn get_client_credits(&self, session_id: &SessionId) -> Option<ClientCredits> {
        self.state
            .lock()
            .await
            .workers
            .get(session_id)
            .map(|slot| ClientCredits::from(&slot.client))
    }

    /// Snapshot of the worker registry, ordered by session id.
    pub async fn list_workers(&self) -> Vec<ConnectedClient> {
        let state = self.state.lock().await;
        let mut clients: Vec<ConnectedClient> =
            state.workers.values().map(|slot| slot.client.clone()).collect();
        clients.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        clients
    }

    /// Task counts per status, for metrics.
    pub async fn task_counts(&self) -> Vec<(TaskStatus, u64)> {
        let state = self.state.lock().await;
        let mut counts = vec![
            (TaskStatus::Pending, 0),
            (TaskStatus::Assigned, 0),
            (TaskStatus::Processing, 0),
            (TaskStatus::Completed, 0),
            (TaskStatus::Failed, 0),
            (TaskStatus::Timeout, 0),
            (TaskStatus::Cancelled, 0),
        ];
        for task in state.tasks.values() {
            if let Some(entry) = counts.iter_mut().find(|(status, _)| *status == task.status) {
                entry.1 += 1;
            }
        }
        counts
    }

    /// Add a worker to the registry. The `worker_registered` acknowledgement
    /// is sent before any assignment the new capacity unlocks.
    pub async fn register_client(
        &self,
        registration: ClientRegistration,
        tx: mpsc::Sender<ServerMessage>,
    ) -> ClientLease {
        let now = Utc::now();
        let (session_id, evicted, outbound) = {
            let mut state = self.state.lock().await;
            let session_id = state.resolve_session_id(registration.session_id.as_deref());
            let client = registration.into_client(session_id.clone(), now);

            info!(
                session_id = %session_id,
                capability = %client.capability,
                gpu = %client.gpu_name,
                tflops = client.estimated_tflops,
                models = ?client.supported_models,
                "Worker registered"
            );

            let (ack, evicted) = state.register_worker(client, tx);
            let mut outbound = vec![ack];
            outbound.extend(state.run_assignment_pass(now));
            (session_id, evicted, outbound)
        };

        self.dispatch(outbound).await;
        self.changed.notify_waiters();
        ClientLease {
            session_id,
            evicted,
        }
    }

    /// Remove a worker. Returns false if it was not registered.
    pub async fn unregister_client(&self, session_id: &SessionId, reason: &str) -> bool {
        let outbound = {
            let mut state = self.state.lock().await;
            if !state.unregister_worker(session_id, Utc::now()) {
                return false;
            }
            info!(session_id = %session_id, reason, "Worker unregistered");
            state.run_assignment_pass(Utc::now())
        };

        self.dispatch(outbound).await;
        self.changed.notify_waiters();
        true
    }

    /// Remove a worker on behalf of the connection that owns `tx`. No-op if
    /// the session is gone or now belongs to another connection.
    pub async fn unregister_connection(
        &self,
        session_id: &SessionId,
        tx: &mpsc::Sender<ServerMessage>,
        reason: &str,
    ) -> bool {
        let outbound = {
            let mut state = self.state.lock().await;
            if !state.unregister_connection(session_id, tx, Utc::now()) {
                debug!(session_id = %session_id, reason, "Connection no longer owns session");
                return false;
            }
            info!(session_id = %session_id, reason, "Worker unregistered");
            state.run_assignment_pass(Utc::now())
        };

        self.dispatch(outbound).await;
        self.changed.notify_waiters();
        true
    }

    /// Refresh a worker's liveness. Returns false for unknown sessions.
    pub async fn client_heartbeat(&self, session_id: &SessionId) -> bool {
        let known = self.state.lock().await.heartbeat(session_id, Utc::now());
        if !known {
            warn!(session_id = %session_id, "Heartbeat from unknown worker");
        }
        known
    }

    /// Apply a worker's result and reuse the freed worker immediately.
    /// Returns false when the report was rejected.
    pub async fn report_task_result(&self, report: ResultReport) -> bool {
        let now = Utc::now();
        let (accepted, outbound) = {
            let mut state = self.state.lock().await;
            if !state.apply_result(&report, now) {
                return false;
            }
            (true, state.run_assignment_pass(now))
        };

        self.dispatch(outbound).await;
        self.changed.notify_waiters();
        accepted
    }

    /// Informational progress from the task's owner.
    pub async fn report_progress(&self, session_id: &SessionId, task_id: &TaskId, progress: f64) -> bool {
        let progress = if progress.is_finite() {
            progress.clamp(0.0, 100.0) as u8
        } else {
            0
        };
        let applied = self
            .state
            .lock()
            .await
            .record_progress(session_id, task_id, progress);
        if applied {
            self.changed.notify_waiters();
        }
        applied
    }

    /// Replace a worker's supported models and retry pending work.
    pub async fn update_capabilities(&self, session_id: &SessionId, models: Vec<String>) -> bool {
        let outbound = {
            let mut state = self.state.lock().await;
            if !state.update_models(session_id, models) {
                warn!(session_id = %session_id, "Capability update from unknown worker");
                return false;
            }
            debug!(session_id = %session_id, "Worker capabilities updated");
            state.run_assignment_pass(Utc::now())
        };

        self.dispatch(outbound).await;
        self.changed.notify_waiters();
        true
    }

    /// Trigger an assignment pass outside of any event.
    pub async fn run_assignment_pass(&self) -> usize {
        let outbound = self.state.lock().await.run_assignment_pass(Utc::now());
        let assigned = outbound.len();
        self.dispatch(outbound).await;
        self.changed.notify_waiters();
        assigned
    }

    /// One reclamation tick at the current time.
    pub async fn sweep(&self) -> SweepSummary {
        self.sweep_at(Utc::now()).await
    }

    /// One reclamation tick evaluated at `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepSummary {
        let (summary, outbound) = self
            .state
            .lock()
            .await
            .sweep(now, self.config.heartbeat_timeout);

        self.dispatch(outbound).await;
        self.changed.notify_waiters();
        summary
    }

    /// Deliver queued messages, each bounded by `send_timeout`. A worker
    /// whose channel is closed or stays full is unregistered, which may
    /// requeue its task and produce further assignments.
    async fn dispatch(&self, mut pending: Vec<Outbound>) {
        while !pending.is_empty() {
            let mut dead: Vec<(SessionId, mpsc::Sender<ServerMessage>)> = Vec::new();
            for out in pending.drain(..) {
                if dead.iter().any(|(session_id, _)| *session_id == out.session_id) {
                    continue;
                }
                if let Err(e) = out.tx.send_timeout(out.message, self.config.send_timeout).await {
                    warn!(session_id = %out.session_id, error = %e, "Send to worker failed");
                    dead.push((out.session_id, out.tx));
                }
            }
            if dead.is_empty() {
                break;
            }

            let mut state = self.state.lock().await;
            for (session_id, tx) in dead {
                if state.unregister_connection(&session_id, &tx, Utc::now()) {
                    info!(session_id = %session_id, "Worker unregistered after send failure");
                }
            }
            pending = state.run_assignment_pass(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn worker(
        coordinator: &Coordinator,
        model: &str,
    ) -> (SessionId, mpsc::Receiver<ServerMessage>) {
        let (tx, mut rx) = mpsc::channel(16);
        let registration = ClientRegistration {
            supported_models: vec![model.to_string()],
            ..ClientRegistration::default()
        };
        let session_id = coordinator.register_client(registration, tx).await.session_id;
        match rx.recv().await {
            Some(ServerMessage::WorkerRegistered(reg)) => assert_eq!(reg.session_id, session_id.as_str()),
            other => panic!("expected worker_registered, got {other:?}"),
        }
        (session_id, rx)
    }

    fn expect_assignment(rx: &mut mpsc::Receiver<ServerMessage>) -> TaskId {
        match rx.try_recv() {
            Ok(ServerMessage::TaskAssignment(a)) => TaskId::new(a.task_id),
            other => panic!("expected task_assignment, got {other:?}"),
        }
    }

    fn success(session_id: &SessionId, task_id: &TaskId, result: Value) -> ResultReport {
        ResultReport {
            session_id: session_id.clone(),
            task_id: task_id.clone(),
            success: true,
            result: Some(result),
            error: None,
            compute_time: 0.25,
        }
    }

    #[tokio::test]
    async fn test_task_stays_pending_without_capable_worker() {
        let coordinator = Coordinator::new(Config::default());
        let (_w, mut rx) = worker(&coordinator, "other-model").await;

        let task_id = coordinator
            .submit_task(TaskRequest::new("embedding", json!("hi"), "m"))
            .await
            .unwrap();
        coordinator.run_assignment_pass().await;

        let status = coordinator.get_task_status(&task_id).await.unwrap();
        assert_eq!(status.status, TaskStatus::Pending);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_assign_complete_and_credit() {
        let coordinator = Coordinator::new(Config::default());
        let (w1, mut rx) = worker(&coordinator, "m").await;

        let task_id = coordinator
            .submit_task(TaskRequest::new("image_features", json!({"url": "a.png"}), "m"))
            .await
            .unwrap();

        assert_eq!(expect_assignment(&mut rx), task_id);
        let status = coordinator.get_task_status(&task_id).await.unwrap();
        assert_eq!(status.status, TaskStatus::Assigned);
        assert_eq!(status.assigned_to, Some(w1.clone()));

        assert!(coordinator.report_task_result(success(&w1, &task_id, json!({"x": 1}))).await);

        let result = coordinator
            .get_task_result(&task_id, false, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(result, Some(json!({"x": 1})));

        let credits = coordinator.get_client_credits(&w1).await.unwrap();
        assert_eq!(credits.credits_earned, 2.0);
        assert_eq!(credits.tasks_completed, 1);
        assert!(coordinator.list_workers().await[0].is_available);
    }

    #[tokio::test]
    async fn test_freed_worker_picks_up_next_task() {
        let coordinator = Coordinator::new(Config::default());
        let (w1, mut rx) = worker(&coordinator, "m").await;

        let first = coordinator.submit_task(TaskRequest::new("embedding", json!(1), "m")).await.unwrap();
        let second = coordinator.submit_task(TaskRequest::new("embedding", json!(2), "m")).await.unwrap();
        assert_eq!(expect_assignment(&mut rx), first);
        assert!(rx.try_recv().is_err());

        coordinator.report_task_result(success(&w1, &first, json!(null))).await;
        assert_eq!(expect_assignment(&mut rx), second);
    }

    #[tokio::test]
    async fn test_batch_split_in_order() {
        let coordinator = Coordinator::new(Config::default());
        let items: Vec<Value> = (0..25).map(|i| json!(i)).collect();

        let ids = coordinator
            .submit_batch_task(BatchRequest::new("embedding", items, "m", 10))
            .await
            .unwrap();

        assert_eq!(ids.len(), 3);
        let state = coordinator.state.lock().await;
        let sizes: Vec<usize> = ids
            .iter()
            .map(|id| state.tasks[id].input_data.as_array().unwrap().len())
            .collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        assert_eq!(state.tasks[&ids[0]].task_type, "embedding_batch");
        assert_eq!(state.tasks[&ids[0]].input_data[0], json!(0));
        assert_eq!(state.tasks[&ids[2]].input_data[4], json!(24));
        assert!(state.tasks[&ids[0]].sequence < state.tasks[&ids[2]].sequence);
    }

    #[tokio::test]
    async fn test_batch_rejects_zero_size() {
        let coordinator = Coordinator::new(Config::default());
        let err = coordinator
            .submit_batch_task(BatchRequest::new("embedding", vec![json!(1)], "m", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_submit_validates_input() {
        let coordinator = Coordinator::new(Config::default());
        assert!(matches!(
            coordinator.submit_task(TaskRequest::new("", json!(null), "m")).await,
            Err(CoordinatorError::InvalidInput(_))
        ));
        assert!(matches!(
            coordinator
                .submit_task(TaskRequest::new("embedding", json!(null), "m").with_timeout(0))
                .await,
            Err(CoordinatorError::InvalidInput(_))
        ));
        assert!(matches!(
            coordinator
                .submit_task(
                    TaskRequest::new("embedding", json!(null), "m").with_timeout(10_000_000_000_000_000)
                )
                .await,
            Err(CoordinatorError::InvalidInput(_))
        ));
        assert_eq!(coordinator.get_stats().await.queue.total, 0);
    }

    #[tokio::test]
    async fn test_disconnect_requeues_without_failure() {
        let coordinator = Coordinator::new(Config::default());
        let (w1, mut rx) = worker(&coordinator, "m").await;
        let task_id = coordinator.submit_task(TaskRequest::new("embedding", json!(1), "m")).await.unwrap();
        expect_assignment(&mut rx);

        assert!(coordinator.unregister_client(&w1, "test").await);

        let status = coordinator.get_task_status(&task_id).await.unwrap();
        assert_eq!(status.status, TaskStatus::Pending);
        assert_eq!(status.retry_count, 1);
        assert!(coordinator.get_client_credits(&w1).await.is_none());

        // A replacement worker gets the task right away.
        let (w2, mut rx2) = worker(&coordinator, "m").await;
        assert_eq!(expect_assignment(&mut rx2), task_id);
        assert_eq!(
            coordinator.get_task_status(&task_id).await.unwrap().assigned_to,
            Some(w2)
        );
    }

    #[tokio::test]
    async fn test_send_failure_unregisters_worker() {
        let coordinator = Coordinator::new(Config::default());
        let (dead, dead_rx) = worker(&coordinator, "m").await;
        drop(dead_rx);

        let task_id = coordinator.submit_task(TaskRequest::new("embedding", json!(1), "m")).await.unwrap();

        assert!(coordinator.get_client_credits(&dead).await.is_none());
        let status = coordinator.get_task_status(&task_id).await.unwrap();
        assert_eq!(status.status, TaskStatus::Pending);
        assert_eq!(status.retry_count, 1);
        coordinator.state.lock().await.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_result_after_completion() {
        let coordinator = Coordinator::new(Config::default());
        let (w1, mut rx) = worker(&coordinator, "m").await;
        let task_id = coordinator.submit_task(TaskRequest::new("embedding", json!(1), "m")).await.unwrap();
        expect_assignment(&mut rx);

        let waiter = {
            let coordinator = coordinator.clone();
            let task_id = task_id.clone();
            tokio::spawn(async move {
                coordinator
                    .get_task_result(&task_id, true, Duration::from_secs(5))
                    .await
            })
        };
        tokio::task::yield_now().await;

        coordinator.report_task_result(success(&w1, &task_id, json!([0.1, 0.2]))).await;

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result, Some(json!([0.1, 0.2])));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let coordinator = Coordinator::new(Config::default());
        let task_id = coordinator.submit_task(TaskRequest::new("embedding", json!(1), "m")).await.unwrap();

        let err = coordinator
            .get_task_result(&task_id, true, Duration::from_millis(20))
            .await
            .unwrap_err();

        assert!(matches!(err, CoordinatorError::WaitTimeout { .. }));
        assert_eq!(
            coordinator.get_task_status(&task_id).await.unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let coordinator = Coordinator::new(Config::default());
        let missing = TaskId::new("missing");
        assert!(coordinator.get_task_status(&missing).await.is_none());
        assert!(matches!(
            coordinator.get_task_result(&missing, true, Duration::from_secs(1)).await,
            Err(CoordinatorError::TaskNotFound(_))
        ));
        assert!(matches!(
            coordinator.cancel_task(&missing).await,
            Err(CoordinatorError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_timeout_scenario_raises_task_failure() {
        let coordinator = Coordinator::new(Config::default());
        let (_w1, mut rx) = worker(&coordinator, "m").await;
        let task_id = coordinator
            .submit_task(
                TaskRequest::new("embedding", json!(1), "m")
                    .with_timeout(1)
                    .with_max_retries(1),
            )
            .await
            .unwrap();
        expect_assignment(&mut rx);

        let assigned_at = coordinator.get_task_status(&task_id).await.unwrap().created_at;
        let first = coordinator
            .sweep_at(assigned_at + chrono::Duration::seconds(5))
            .await;
        assert_eq!(first.requeued, 1);
        assert_eq!(coordinator.get_task_status(&task_id).await.unwrap().retry_count, 1);

        let second = coordinator
            .sweep_at(assigned_at + chrono::Duration::seconds(10))
            .await;
        assert_eq!(second.timed_out, 1);

        let err = coordinator
            .get_task_result(&task_id, true, Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            CoordinatorError::TaskFailed { status, .. } => assert_eq!(status, TaskStatus::Timeout),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_assigned_task_notifies_worker() {
        let coordinator = Coordinator::new(Config::default());
        let (w1, mut rx) = worker(&coordinator, "m").await;
        let (task_id, done) = coordinator
            .submit_task_with_completion(TaskRequest::new("embedding", json!(1), "m"))
            .await
            .unwrap();
        expect_assignment(&mut rx);

        assert!(coordinator.cancel_task(&task_id).await.unwrap());
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::CancelTask(c)) if c.task_id == task_id.as_str()));
        assert!(!coordinator.cancel_task(&task_id).await.unwrap());

        // The worker ignores the notice and reports anyway.
        assert!(!coordinator.report_task_result(success(&w1, &task_id, json!(1))).await);

        let outcome = done.await.unwrap();
        assert!(matches!(outcome, TaskOutcome::Failed { status: TaskStatus::Cancelled, .. }));
        let credits = coordinator.get_client_credits(&w1).await.unwrap();
        assert_eq!(credits.tasks_failed, 0);
        assert_eq!(credits.credits_earned, 0.0);
    }

    #[tokio::test]
    async fn test_urgent_task_overtakes_queue() {
        let coordinator = Coordinator::new(Config::default());
        for i in 0..3 {
            coordinator.submit_task(TaskRequest::new("embedding", json!(i), "m")).await.unwrap();
        }
        let urgent = coordinator
            .submit_task(TaskRequest::new("embedding", json!("now"), "m").with_priority(Priority::Urgent))
            .await
            .unwrap();

        let (_w1, mut rx) = worker(&coordinator, "m").await;
        assert_eq!(expect_assignment(&mut rx), urgent);
    }

    #[tokio::test]
    async fn test_capability_update_unblocks_pending_work() {
        let coordinator = Coordinator::new(Config::default());
        let (w1, mut rx) = worker(&coordinator, "old").await;
        let task_id = coordinator.submit_task(TaskRequest::new("embedding", json!(1), "new")).await.unwrap();
        assert!(rx.try_recv().is_err());

        assert!(coordinator.update_capabilities(&w1, vec!["new".into()]).await);
        assert_eq!(expect_assignment(&mut rx), task_id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_events_keep_state_consistent() {
        use futures_util::future::join_all;

        let coordinator = Coordinator::new(Config::default());

        let submits = (0..20).map(|i| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .submit_task(TaskRequest::new("embedding", json!(i), "m"))
                    .await
                    .unwrap()
            })
        });
        let registrations = (0..5).map(|_| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                let (tx, rx) = mpsc::channel(64);
                let registration = ClientRegistration {
                    supported_models: vec!["m".to_string()],
                    ..ClientRegistration::default()
                };
                let lease = coordinator.register_client(registration, tx).await;
                (lease.session_id, rx)
            })
        });
        let (_, workers) = tokio::join!(join_all(submits), join_all(registrations));
        let mut workers: Vec<_> = workers.into_iter().map(Result::unwrap).collect();

        let held = |state: &SchedulerState| {
            let owners: Vec<SessionId> = state
                .tasks
                .values()
                .filter(|t| t.status.is_held())
                .filter_map(|t| t.assigned_to.clone())
                .collect();
            let mut distinct = owners.clone();
            distinct.sort();
            distinct.dedup();
            assert_eq!(distinct.len(), owners.len(), "a worker holds two tasks");
            owners.len()
        };
        {
            let state = coordinator.state.lock().await;
            state.check_invariants().unwrap();
            assert_eq!(held(&*state), 5);
        }

        // Every worker reports at once; each should pick up exactly one more task.
        let reports = workers.iter_mut().map(|(session_id, rx)| {
            let task_id = loop {
                match rx.try_recv() {
                    Ok(ServerMessage::TaskAssignment(a)) => break TaskId::new(a.task_id),
                    Ok(_) => continue,
                    Err(e) => panic!("worker {session_id} got no assignment: {e}"),
                }
            };
            let coordinator = coordinator.clone();
            let report = success(session_id, &task_id, json!("done"));
            tokio::spawn(async move { coordinator.report_task_result(report).await })
        });
        for accepted in join_all(reports).await {
            assert!(accepted.unwrap());
        }

        let state = coordinator.state.lock().await;
        state.check_invariants().unwrap();
        assert_eq!(held(&*state), 5);
        assert_eq!(state.totals.tasks_completed, 5);
    }

    #[tokio::test]
    async fn test_stats_track_totals() {
        let coordinator = Coordinator::new(Config::default());
        let (w1, mut rx) = worker(&coordinator, "m").await;
        let task_id = coordinator.submit_task(TaskRequest::new("sentiment", json!(1), "m")).await.unwrap();
        coordinator.submit_task(TaskRequest::new("sentiment", json!(2), "m")).await.unwrap();
        expect_assignment(&mut rx);
        coordinator.report_task_result(success(&w1, &task_id, json!("pos"))).await;

        let stats = coordinator.get_stats().await;
        assert_eq!(stats.totals.tasks_submitted, 2);
        assert_eq!(stats.totals.tasks_completed, 1);
        assert_eq!(stats.totals.credits_awarded, 0.5);
        assert_eq!(stats.queue.processing, 1);
        assert_eq!(stats.clients.connected, 1);
        assert_eq!(stats.top_contributors[0].session_id, w1);
    }
}
