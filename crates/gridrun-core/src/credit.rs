//! Static reward table keyed by task type.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Credits awarded for task types without an explicit rate.
pub const DEFAULT_CREDIT: f64 = 1.0;

/// Maps a task type to the credits a worker earns for completing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditTable {
    rates: HashMap<String, f64>,
    default_rate: f64,
}

impl CreditTable {
    /// An empty table where every type earns `default_rate`.
    pub fn flat(default_rate: f64) -> Self {
        Self {
            rates: HashMap::new(),
            default_rate,
        }
    }

    /// Builder method to set the rate for one task type.
    pub fn with_rate(mut self, task_type: impl Into<String>, credits: f64) -> Self {
        self.rates.insert(task_type.into(), credits);
        self
    }

    /// Credits for completing one task of `task_type`.
    pub fn credits_for(&self, task_type: &str) -> f64 {
        self.rates.get(task_type).copied().unwrap_or(self.default_rate)
    }
}

impl Default for CreditTable {
    fn default() -> Self {
        Self::flat(DEFAULT_CREDIT)
            .with_rate("embedding", 1.0)
            .with_rate("sentiment", 0.5)
            .with_rate("image_features", 2.0)
            .with_rate("batch_inference", 5.0)
            .with_rate("llm_inference", 3.0)
            .with_rate("embedding_batch", 5.0)
            .with_rate("sentiment_batch", 2.5)
    }
}
