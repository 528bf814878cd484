use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};

use crate::coordinator::Coordinator;

/// Queue, worker and lifetime totals.
pub async fn get_stats(State(coordinator): State<Arc<Coordinator>>) -> impl IntoResponse {
    Json(coordinator.get_stats().await)
}
