//! GridRun Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/WebSocket transport
//! - The async runtime
//! - Scheduler state locking
//!
//! All types here describe the volunteer-compute domain: tasks, the workers
//! that execute them, and the rules that decide who runs what.

pub mod client;
pub mod credit;
pub mod error;
pub mod ids;
pub mod outcome;
pub mod scoring;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use client::ConnectedClient;
pub use credit::CreditTable;
pub use error::CoreError;
pub use ids::{SessionId, TaskId};
pub use outcome::TaskOutcome;
pub use scoring::ScoringWeights;
pub use status::{Priority, TaskStatus};
pub use task::ComputeTask;
