//! Liveness probe and the Prometheus scrape endpoint for the coordinator.

use std::sync::Arc;

use axum::{extract::State, http::header, response::IntoResponse, Json};

use crate::coordinator::Coordinator;

/// Always `{"status":"ok"}` while the server accepts requests.
pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Worker, task and credit gauges in text exposition format.
pub async fn metrics_handler(State(coordinator): State<Arc<Coordinator>>) -> impl IntoResponse {
    let body = crate::metrics::collect_metrics(&coordinator).await;
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}
