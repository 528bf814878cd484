//! Worker list and credit handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};

use gridrun_core::SessionId;

use crate::coordinator::Coordinator;
use crate::error::CoordinatorError;
use crate::http::responses::WorkerResponse;
use crate::views::ClientCredits;

/// List workers as JSON.
pub async fn list_workers_json(State(coordinator): State<Arc<Coordinator>>) -> impl IntoResponse {
    let response: Vec<WorkerResponse> = coordinator
        .list_workers()
        .await
        .iter()
        .map(WorkerResponse::from)
        .collect();
    Json(response)
}

/// Credits and counters for one connected worker.
pub async fn get_worker_credits(
    State(coordinator): State<Arc<Coordinator>>,
    Path(session_id): Path<String>,
) -> Result<Json<ClientCredits>, CoordinatorError> {
    let session_id = SessionId::new(session_id);
    coordinator
        .get_client_credits(&session_id)
        .await
        .map(Json)
        .ok_or(CoordinatorError::ClientNotFound(session_id))
}
