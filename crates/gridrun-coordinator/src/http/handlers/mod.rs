//! HTTP request handlers.

mod health;
mod stats;
mod workers;

pub use health::{health_check, metrics_handler};
pub use stats::get_stats;
pub use workers::{get_worker_credits, list_workers_json};
