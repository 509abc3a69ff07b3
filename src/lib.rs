//! memoria client library
//!
//! This library provides the client side of the memoria memory store:
//!
//! - `ipc` - JSON-RPC transport to the worker process over stdio
//! - `memory` - Typed search/store/recall/list/stats/delete operations
//! - `models` - Data models returned by the worker
//! - `config` - Worker launch and timeout configuration
//!
//! # Usage
//!
//! ```ignore
//! use memoria::config::WorkerConfig;
//! use memoria::ipc::RpcClient;
//!
//! let client = RpcClient::new(WorkerConfig::load(None)?);
//! client.connect().await?;
//! for entry in client.search("tokio reader task", 10).await {
//!     println!("{} {}", entry.id, entry.content);
//! }
//! client.disconnect().await;
//! ```

pub mod config;
pub mod ipc;
pub mod memory;
pub mod models;
