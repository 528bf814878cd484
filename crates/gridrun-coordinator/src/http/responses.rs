//! HTTP response types.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use gridrun_core::ConnectedClient;

use crate::error::CoordinatorError;

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for CoordinatorError {
    fn into_response(self) -> Response {
        let status = match &self {
            CoordinatorError::TaskNotFound(_) | CoordinatorError::ClientNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            CoordinatorError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            CoordinatorError::TaskFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            CoordinatorError::WaitTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        };
        let body = ErrorResponse {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Response for a single worker.
#[derive(Debug, Serialize)]
pub struct WorkerResponse {
    pub session_id: String,
    pub capability: String,
    pub gpu_name: String,
    pub estimated_tflops: f64,
    /// IDLE or BUSY.
    pub state: String,
    pub current_task: Option<String>,
    pub supported_models: Vec<String>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub credits_earned: f64,
    pub last_heartbeat: String,
    pub connected_at: String,
}

impl From<&ConnectedClient> for WorkerResponse {
    fn from(client: &ConnectedClient) -> Self {
        Self {
            session_id: client.session_id.as_str().to_string(),
            capability: client.capability.clone(),
            gpu_name: client.gpu_name.clone(),
            estimated_tflops: client.estimated_tflops,
            state: if client.is_available { "IDLE" } else { "BUSY" }.to_string(),
            current_task: client.current_task.as_ref().map(|t| t.as_str().to_string()),
            supported_models: client.supported_models.iter().cloned().collect(),
            tasks_completed: client.tasks_completed,
            tasks_failed: client.tasks_failed,
            credits_earned: client.credits_earned,
            last_heartbeat: client.last_heartbeat.to_rfc3339(),
            connected_at: client.connected_at.to_rfc3339(),
        }
    }
}
