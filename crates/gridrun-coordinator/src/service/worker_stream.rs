//! Worker connection handling.
//!
//! Each WebSocket connection is owned by one task. Inbound frames are decoded
//! and applied through the [`Coordinator`]; outbound [`ServerMessage`]s arrive
//! on an mpsc channel and are written by a dedicated send task.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use gridrun_core::{SessionId, TaskId};
use gridrun_proto::{
    ClientMessage, ProtoError, Register, ServerMessage, TaskProgress, TaskResult, WorkerRegistered,
};

use crate::coordinator::{ClientRegistration, Coordinator};
use crate::state::ResultReport;

/// How long the send task may take to flush after the reader stops.
const SEND_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Advisory metadata from the connection URL.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HandshakeParams {
    pub capability: Option<String>,
    pub gpu_name: Option<String>,
    pub estimated_tflops: Option<f64>,
}

impl HandshakeParams {
    /// Seed a registration from the handshake; fields in `register` win.
    pub fn registration(&self, register: Register) -> ClientRegistration {
        ClientRegistration {
            session_id: register.session_id,
            capability: register.capability.or_else(|| self.capability.clone()),
            gpu_name: register.gpu_name.or_else(|| self.gpu_name.clone()),
            estimated_tflops: register.estimated_tflops.or(self.estimated_tflops),
            supported_models: register.supported_models,
        }
    }
}

/// `GET /ws/compute` upgrade handler.
pub async fn worker_socket(
    ws: WebSocketUpgrade,
    Query(handshake): Query<HandshakeParams>,
    State(coordinator): State<Arc<Coordinator>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, coordinator, handshake))
}

async fn handle_socket(socket: WebSocket, coordinator: Arc<Coordinator>, handshake: HandshakeParams) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<ServerMessage>(coordinator.config().outbound_buffer);

    debug!(?handshake, "Worker connection opened");

    // Forward queued messages to the socket.
    let mut send_task = tokio::spawn(async move {
        let mut outbound = ReceiverStream::new(rx);
        while let Some(message) = outbound.next().await {
            let text = match gridrun_proto::encode(&message) {
                Ok(text) => text,
                Err(e) => {
                    error!(error = %e, "Failed to encode message");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let mut connection = WorkerConnection::new(coordinator, handshake, tx);
    let reason = loop {
        let frame = tokio::select! {
            frame = receiver.next() => frame,
            _ = connection.evicted() => {
                info!(session_id = ?connection.session_id(), "Worker evicted, closing connection");
                break "evicted";
            }
        };
        match frame {
            Some(Ok(Message::Text(text))) => {
                if !connection.handle_frame(&text).await {
                    break "disconnect requested";
                }
            }
            Some(Ok(Message::Binary(bytes))) => {
                if !connection.handle_bytes(&bytes).await {
                    break "disconnect requested";
                }
            }
            Some(Ok(Message::Close(_))) | None => break "connection closed",
            // Ping/pong is answered by the WebSocket layer.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(error = %e, "Worker stream error");
                break "stream error";
            }
        }
    };

    connection.close(reason).await;
    drop(connection);

    if tokio::time::timeout(SEND_DRAIN_TIMEOUT, &mut send_task).await.is_err() {
        send_task.abort();
    }
}

/// Protocol state for one worker connection.
pub struct WorkerConnection {
    coordinator: Arc<Coordinator>,
    handshake: HandshakeParams,
    tx: mpsc::Sender<ServerMessage>,
    session_id: Option<SessionId>,
    /// Resolves when the coordinator drops this connection's worker.
    evicted: Option<oneshot::Receiver<()>>,
}

impl WorkerConnection {
    pub fn new(
        coordinator: Arc<Coordinator>,
        handshake: HandshakeParams,
        tx: mpsc::Sender<ServerMessage>,
    ) -> Self {
        Self {
            coordinator,
            handshake,
            tx,
            session_id: None,
            evicted: None,
        }
    }

    /// Session issued by the last `register`, if any.
    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    /// Completes once the registered worker has been removed by the
    /// coordinator. Pending forever before registration.
    pub async fn evicted(&mut self) {
        match self.evicted.as_mut() {
            Some(evicted) => {
                let _ = evicted.await;
                self.evicted = None;
            }
            None => std::future::pending::<()>().await,
        }
    }

    /// Handle a text frame. Returns false when the connection should close.
    pub async fn handle_frame(&mut self, frame: &str) -> bool {
        self.handle_decoded(gridrun_proto::decode(frame)).await
    }

    /// Handle a binary frame carrying UTF-8 JSON.
    pub async fn handle_bytes(&mut self, frame: &[u8]) -> bool {
        self.handle_decoded(gridrun_proto::decode_bytes(frame)).await
    }

    async fn handle_decoded(&mut self, decoded: Result<ClientMessage, ProtoError>) -> bool {
        match decoded {
            Ok(message) => self.handle_message(message).await,
            Err(e) => {
                warn!(session_id = ?self.session_id, error = %e, "Rejected worker frame");
                self.reply(ServerMessage::error(e.to_string())).await;
                true
            }
        }
    }

    /// Apply one decoded message. Returns false on `disconnect`.
    pub async fn handle_message(&mut self, message: ClientMessage) -> bool {
        if let ClientMessage::Register(register) = message {
            self.handle_register(register).await;
            return true;
        }

        let Some(session_id) = self.session_id.clone() else {
            if matches!(message, ClientMessage::Disconnect {}) {
                return false;
            }
            warn!(?message, "Message before register ignored");
            return true;
        };

        match message {
            ClientMessage::Register(_) => {}
            ClientMessage::TaskResult(result) => self.handle_result(session_id, result).await,
            ClientMessage::TaskProgress(progress) => self.handle_progress(&session_id, progress).await,
            ClientMessage::Heartbeat {} => {
                if self.coordinator.client_heartbeat(&session_id).await {
                    self.reply(ServerMessage::HeartbeatAck {}).await;
                }
            }
            ClientMessage::CapabilityUpdate(update) => {
                self.coordinator
                    .update_capabilities(&session_id, update.supported_models)
                    .await;
            }
            ClientMessage::Disconnect {} => {
                info!(session_id = %session_id, "Worker requested disconnect");
                return false;
            }
        }
        true
    }

    async fn handle_register(&mut self, register: Register) {
        // Re-register on a live connection refreshes the model set.
        if let Some(session_id) = self.session_id.clone() {
            let updated = self
                .coordinator
                .update_capabilities(&session_id, register.supported_models.clone())
                .await;
            if updated {
                self.reply(ServerMessage::WorkerRegistered(WorkerRegistered {
                    session_id: session_id.into_inner(),
                    supported_models: register.supported_models,
                }))
                .await;
                return;
            }
            warn!(session_id = %session_id, "Session no longer registered, registering afresh");
            self.session_id = None;
            self.evicted = None;
        }

        let registration = self.handshake.registration(register);
        let lease = self
            .coordinator
            .register_client(registration, self.tx.clone())
            .await;
        self.session_id = Some(lease.session_id);
        self.evicted = Some(lease.evicted);
    }

    async fn handle_result(&self, session_id: SessionId, result: TaskResult) {
        let report = ResultReport {
            session_id,
            task_id: TaskId::new(result.task_id),
            success: result.success,
            result: result.result,
            error: result.error,
            compute_time: result.compute_time,
        };
        self.coordinator.report_task_result(report).await;
    }

    async fn handle_progress(&self, session_id: &SessionId, progress: TaskProgress) {
        let task_id = TaskId::new(progress.task_id);
        self.coordinator
            .report_progress(session_id, &task_id, progress.progress)
            .await;
    }

    /// Unregister the worker if this connection still owns its session.
    /// Safe to call more than once.
    pub async fn close(&mut self, reason: &str) {
        self.evicted = None;
        if let Some(session_id) = self.session_id.take() {
            self.coordinator
                .unregister_connection(&session_id, &self.tx, reason)
                .await;
        }
    }

    async fn reply(&self, message: ServerMessage) {
        let timeout = self.coordinator.config().send_timeout;
        if let Err(e) = self.tx.send_timeout(message, timeout).await {
            debug!(session_id = ?self.session_id, error = %e, "Reply dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::coordinator::TaskRequest;
    use gridrun_core::TaskStatus;
    use serde_json::json;

    fn connection(handshake: HandshakeParams) -> (WorkerConnection, mpsc::Receiver<ServerMessage>) {
        let coordinator = Coordinator::new(Config::default());
        let (tx, rx) = mpsc::channel(16);
        (WorkerConnection::new(coordinator, handshake, tx), rx)
    }

    async fn registered() -> (WorkerConnection, mpsc::Receiver<ServerMessage>) {
        let (mut conn, mut rx) = connection(HandshakeParams::default());
        assert!(conn.handle_frame(r#"{"type":"register","supported_models":["m"]}"#).await);
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::WorkerRegistered(_))));
        (conn, rx)
    }

    #[tokio::test]
    async fn test_register_merges_handshake() {
        let handshake = HandshakeParams {
            capability: Some("gpu".into()),
            gpu_name: Some("RTX 2080".into()),
            estimated_tflops: Some(10.0),
        };
        let (mut conn, mut rx) = connection(handshake);

        assert!(
            conn.handle_frame(r#"{"type":"register","gpu_name":"RTX 4090","supported_models":["m"]}"#)
                .await
        );

        let session_id = conn.session_id().cloned().unwrap();
        match rx.try_recv() {
            Ok(ServerMessage::WorkerRegistered(reg)) => {
                assert_eq!(reg.session_id, session_id.as_str());
                assert_eq!(reg.supported_models, vec!["m".to_string()]);
            }
            other => panic!("expected worker_registered, got {other:?}"),
        }

        let workers = conn.coordinator.list_workers().await;
        assert_eq!(workers[0].gpu_name, "RTX 4090");
        assert_eq!(workers[0].capability, "gpu");
        assert_eq!(workers[0].estimated_tflops, 10.0);
    }

    #[tokio::test]
    async fn test_heartbeat_is_acknowledged() {
        let (mut conn, mut rx) = registered().await;
        assert!(conn.handle_frame(r#"{"type":"heartbeat"}"#).await);
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::HeartbeatAck {})));
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error_and_stays_open() {
        let (mut conn, mut rx) = registered().await;

        assert!(conn.handle_frame("not json").await);
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Error(_))));

        assert!(conn.handle_frame(r#"{"type":"launch_missiles"}"#).await);
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Error(_))));

        assert!(conn.session_id().is_some());
    }

    #[tokio::test]
    async fn test_messages_before_register_are_ignored() {
        let (mut conn, mut rx) = connection(HandshakeParams::default());
        assert!(conn.handle_frame(r#"{"type":"heartbeat"}"#).await);
        assert!(rx.try_recv().is_err());
        assert!(conn.coordinator.list_workers().await.is_empty());
    }

    #[tokio::test]
    async fn test_result_frame_completes_task() {
        let (mut conn, mut rx) = registered().await;
        let task_id = conn
            .coordinator
            .submit_task(TaskRequest::new("embedding", json!("hello"), "m"))
            .await
            .unwrap();
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::TaskAssignment(_))));

        let progress = json!({"type": "task_progress", "task_id": task_id.as_str(), "progress": 40.0});
        assert!(conn.handle_frame(&progress.to_string()).await);
        let status = conn.coordinator.get_task_status(&task_id).await.unwrap();
        assert_eq!(status.status, TaskStatus::Processing);
        assert_eq!(status.progress, Some(40));

        let frame = json!({
            "type": "task_result",
            "task_id": task_id.as_str(),
            "success": true,
            "result": [0.5, 0.25],
            "compute_time": 0.8
        });
        assert!(conn.handle_frame(&frame.to_string()).await);

        let status = conn.coordinator.get_task_status(&task_id).await.unwrap();
        assert_eq!(status.status, TaskStatus::Completed);
        assert_eq!(status.result, Some(json!([0.5, 0.25])));
    }

    #[tokio::test]
    async fn test_disconnect_unregisters() {
        let (mut conn, _rx) = registered().await;
        let coordinator = conn.coordinator.clone();

        assert!(!conn.handle_frame(r#"{"type":"disconnect"}"#).await);
        conn.close("disconnect requested").await;

        assert!(coordinator.list_workers().await.is_empty());
        // Closing twice is harmless.
        conn.close("again").await;
    }

    fn stale_tick() -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now() + chrono::Duration::seconds(200)
    }

    #[tokio::test]
    async fn test_pruned_worker_connection_is_evicted() {
        let (mut conn, _rx) = registered().await;

        let summary = conn.coordinator.sweep_at(stale_tick()).await;
        assert_eq!(summary.pruned.len(), 1);

        tokio::time::timeout(Duration::from_secs(1), conn.evicted())
            .await
            .expect("pruned connection should be told to close");
    }

    #[tokio::test]
    async fn test_reregister_after_prune_registers_afresh() {
        let (mut conn, mut rx) = registered().await;
        conn.coordinator.sweep_at(stale_tick()).await;
        assert!(conn.coordinator.list_workers().await.is_empty());

        assert!(conn.handle_frame(r#"{"type":"register","supported_models":["m"]}"#).await);

        let session_id = conn.session_id().cloned().unwrap();
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::WorkerRegistered(r)) if r.session_id == session_id.as_str()));
        assert_eq!(conn.coordinator.list_workers().await.len(), 1);

        let task_id = conn
            .coordinator
            .submit_task(TaskRequest::new("embedding", json!(1), "m"))
            .await
            .unwrap();
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::TaskAssignment(a)) if a.task_id == task_id.as_str()));
    }

    #[tokio::test]
    async fn test_stale_connection_close_keeps_resumed_session() {
        let coordinator = Coordinator::new(Config::default());
        let register = r#"{"type":"register","session_id":"s1","supported_models":["m"]}"#;

        let (old_tx, _old_rx) = mpsc::channel(16);
        let mut stale = WorkerConnection::new(coordinator.clone(), HandshakeParams::default(), old_tx);
        assert!(stale.handle_frame(register).await);
        coordinator.sweep_at(stale_tick()).await;

        let (new_tx, _new_rx) = mpsc::channel(16);
        let mut resumed = WorkerConnection::new(coordinator.clone(), HandshakeParams::default(), new_tx);
        assert!(resumed.handle_frame(register).await);
        assert_eq!(resumed.session_id().map(SessionId::as_str), Some("s1"));

        stale.close("connection closed").await;

        let workers = coordinator.list_workers().await;
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].session_id.as_str(), "s1");
    }

    #[tokio::test]
    async fn test_reregister_updates_models() {
        let (mut conn, mut rx) = registered().await;
        let session_id = conn.session_id().cloned().unwrap();

        assert!(conn.handle_frame(r#"{"type":"register","supported_models":["m","n"]}"#).await);

        assert!(matches!(rx.try_recv(), Ok(ServerMessage::WorkerRegistered(r)) if r.session_id == session_id.as_str()));
        let workers = conn.coordinator.list_workers().await;
        assert_eq!(workers.len(), 1);
        assert!(workers[0].supported_models.contains("n"));
    }
}
