//! Wire protocol for GridRun worker connections.
//!
//! Every frame is a JSON object whose `type` field selects the message.
//! This crate contains:
//! - [`ClientMessage`]: frames a worker sends to the coordinator
//! - [`ServerMessage`]: frames the coordinator pushes to a worker
//! - Converters between wire types and domain types

pub mod convert;
pub mod message;

pub use message::{
    CancelTask, CapabilityUpdate, ClientMessage, ErrorFrame, Register, ServerMessage,
    TaskAssignment, TaskProgress, TaskResult, WorkerRegistered,
};

use thiserror::Error;

/// Errors while reading or writing a frame.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Parse one worker frame.
pub fn decode(frame: &str) -> Result<ClientMessage, ProtoError> {
    Ok(serde_json::from_str(frame)?)
}

/// Parse one worker frame delivered as bytes.
pub fn decode_bytes(frame: &[u8]) -> Result<ClientMessage, ProtoError> {
    Ok(serde_json::from_slice(frame)?)
}

/// Serialize one coordinator frame.
pub fn encode(message: &ServerMessage) -> Result<String, ProtoError> {
    Ok(serde_json::to_string(message)?)
}
