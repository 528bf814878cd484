//! HTTP server for the coordinator.
//!
//! Provides endpoints for:
//! - Worker connections (`/ws/compute`)
//! - Coordinator stats (`/v1/stats`)
//! - Worker list API (`/v1/workers`)
//! - Per-worker credits (`/v1/workers/:session_id/credits`)
//! - Health check (`/health`)
//! - Prometheus metrics (`/metrics`)

use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::coordinator::Coordinator;
use crate::service;

mod handlers;
pub mod responses;

/// Create the HTTP router.
pub fn create_router(coordinator: Arc<Coordinator>) -> Router {
    // CORS layer for dashboard access
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Worker transport
        .route("/ws/compute", get(service::worker_socket))
        // API routes
        .route("/v1/stats", get(handlers::get_stats))
        .route("/v1/workers", get(handlers::list_workers_json))
        .route("/v1/workers/:session_id/credits", get(handlers::get_worker_credits))
        // Observability routes
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(coordinator)
}
