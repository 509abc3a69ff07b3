//! Error taxonomy for the worker connection.

use std::time::Duration;

use thiserror::Error;

use crate::ipc::protocol::RpcErrorObject;

/// IPC-specific error types.
///
/// These errors provide actionable messages for common failure modes
/// when communicating with the worker process.
#[derive(Debug, Error)]
pub enum IpcError {
    /// The worker process could not be launched.
    #[error("Failed to spawn worker `{command}`: {source}")]
    Spawn {
        /// Program that was being launched
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The `initialize` exchange failed or timed out.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// A single line from the worker could not be decoded.
    ///
    /// Only ever logged by the reader task; never returned to a caller.
    #[error("Failed to decode worker message: {0}")]
    Decode(String),

    /// The worker answered with a JSON-RPC error envelope.
    #[error("Worker error {code}: {message}")]
    Remote {
        /// JSON-RPC error code
        code: i64,
        /// Error message
        message: String,
        /// Optional additional data
        data: Option<serde_json::Value>,
    },

    /// No response arrived before the request deadline.
    #[error("Request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The connection closed while the request was outstanding.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A request was issued while the client was not in the ready state.
    #[error("Not connected to worker")]
    NotConnected,

    /// Request serialization or result decoding failed.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

impl IpcError {
    /// Whether this error aborted `connect()` (spawn or handshake failure).
    pub fn is_connection_error(&self) -> bool {
        matches!(self, IpcError::Spawn { .. } | IpcError::Handshake(_))
    }
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::UnexpectedEof => IpcError::ConnectionClosed,
            _ => IpcError::Io(err),
        }
    }
}

impl From<RpcErrorObject> for IpcError {
    fn from(err: RpcErrorObject) -> Self {
        IpcError::Remote {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}
