//! Message definitions, one struct per payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames sent by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Register(Register),
    TaskResult(TaskResult),
    TaskProgress(TaskProgress),
    Heartbeat {},
    CapabilityUpdate(CapabilityUpdate),
    /// Graceful close.
    Disconnect {},
}

/// Frames pushed to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    WorkerRegistered(WorkerRegistered),
    TaskAssignment(TaskAssignment),
    HeartbeatAck {},
    CancelTask(CancelTask),
    Error(ErrorFrame),
}

/// Worker introduction. Every field is optional so that values from the
/// connection query string can fill the gaps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Register {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_tflops: Option<f64>,

    #[serde(default)]
    pub supported_models: Vec<String>,

    /// Previous session id. Empty or already-live ids are replaced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRegistered {
    pub session_id: String,
    pub supported_models: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: String,
    pub task_type: String,
    pub input_data: Value,
    pub model_id: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Seconds spent computing.
    #[serde(default)]
    pub compute_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub task_id: String,
    /// Percentage, 0-100. Larger values are clamped.
    pub progress: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityUpdate {
    #[serde(default)]
    pub supported_models: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelTask {
    pub task_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub message: String,
}
