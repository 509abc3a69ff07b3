//! IPC client for communication with the memoria worker.
//!
//! This module provides the Rust-side boundary to the worker process: it
//! launches the worker, speaks JSON-RPC over the worker's stdin/stdout, and
//! matches responses to the callers waiting on them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐       stdin / stdout        ┌─────────────────────┐
//! │    RpcClient    │  ◄────────────────────────► │   memoria worker    │
//! │  (reader task)  │    JSON-RPC, one per line   │   (child process)   │
//! └─────────────────┘                             └─────────────────────┘
//! ```
//!
//! # Protocol
//!
//! Each message is a single line of JSON:
//!
//! ```text
//! {"protocol":"2.0","method":"memory_stats","params":{},"id":1}
//! {"protocol":"2.0","id":1,"result":{"total_documents":3,"components":{}}}
//! ```
//!
//! Stderr is drained to the log and never parsed.
//!
//! # Usage
//!
//! ```ignore
//! use memoria::config::WorkerConfig;
//! use memoria::ipc::RpcClient;
//! use serde_json::json;
//!
//! let client = RpcClient::new(WorkerConfig::load(None)?);
//! client.connect().await?;
//! let result = client.call_default("memory_stats", json!({})).await?;
//! ```

mod client;
mod error;
mod framing;
mod pending;
mod protocol;
mod worker;

pub use client::{ConnectionState, RpcClient, INITIALIZED_NOTIFICATION, INITIALIZE_METHOD};
pub use error::IpcError;
pub use framing::{write_line, LineFramer};
pub use pending::{Outcome, PendingTable};
pub use protocol::{
    Incoming, NotificationEnvelope, RequestEnvelope, ResponseEnvelope, RpcErrorObject,
    PROTOCOL_VERSION_TAG,
};
