//! Coordinator configuration.

use std::time::Duration;

use gridrun_core::task::{DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_SECONDS};
use gridrun_core::{CreditTable, ScoringWeights};

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP/WebSocket bind address.
    pub bind_addr: String,

    /// Period of the reclamation sweep.
    pub sweep_interval: Duration,

    /// Heartbeat silence after which a worker is pruned. Independent of
    /// any task's own timeout.
    pub heartbeat_timeout: Duration,

    /// Upper bound on enqueueing one message for a worker connection.
    pub send_timeout: Duration,

    /// Assignment timeout for tasks submitted without one.
    pub default_timeout_seconds: u64,

    pub default_max_retries: u32,

    /// Outbound message buffer per worker connection.
    pub outbound_buffer: usize,

    pub scoring: ScoringWeights,

    pub credits: CreditTable,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8765".to_string(),
            sweep_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(120),
            send_timeout: Duration::from_secs(5),
            default_timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            default_max_retries: DEFAULT_MAX_RETRIES,
            outbound_buffer: 32,
            scoring: ScoringWeights::default(),
            credits: CreditTable::default(),
        }
    }
}
