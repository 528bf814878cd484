//! Weights for ranking idle workers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Heuristic weights used by [`ConnectedClient::priority_score`].
///
/// The score only orders candidates; it carries no correctness meaning.
///
/// [`ConnectedClient::priority_score`]: crate::ConnectedClient::priority_score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    /// Multiplier applied to self-reported TFLOPS.
    pub tflops_weight: f64,

    /// Multiplier applied to `completed / (completed + failed)`.
    pub success_weight: f64,

    /// Flat bonus for a worker that heartbeated within `recency_window`.
    pub recency_bonus: f64,

    pub recency_window: Duration,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            tflops_weight: 10.0,
            success_weight: 20.0,
            recency_bonus: 10.0,
            recency_window: Duration::from_secs(30),
        }
    }
}
