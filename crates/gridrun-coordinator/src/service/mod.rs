//! Worker transport over WebSocket.

pub mod worker_stream;

pub use worker_stream::{worker_socket, HandshakeParams, WorkerConnection};
