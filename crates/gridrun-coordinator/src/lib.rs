//! GridRun Coordinator Library
//!
//! This crate provides the scheduling core of GridRun: the task queue, the
//! worker registry, the assignment engine, the reclamation sweep, the
//! WebSocket transport that volunteer workers attach to, and the
//! [`Coordinator`] facade consumed by task producers.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod http;
pub mod metrics;
pub mod reclaim;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod views;

pub use config::Config;
pub use coordinator::{BatchRequest, ClientLease, ClientRegistration, Coordinator, TaskRequest};
pub use error::CoordinatorError;
pub use reclaim::{spawn_sweeper, SweepSummary};
pub use state::{ResultReport, SchedulerState};
pub use views::{ClientCredits, CoordinatorStats, TaskStatusView};
