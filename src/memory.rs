//! Typed memory operations on top of [`RpcClient`].
//!
//! Each method is a fixed-shape wrapper over [`RpcClient::call_default`].
//! Read paths that return a sequence or an optional entry never fail: any
//! error, including an undecodable result, is logged and turned into an
//! empty or absent value. Methods with a scalar result propagate errors.

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::warn;

use crate::ipc::{IpcError, RpcClient};
use crate::models::{MemoryEntry, MemoryStats, NewMemory};

pub const METHOD_SEARCH: &str = "memory_search";
pub const METHOD_STORE: &str = "memory_store";
pub const METHOD_RECALL: &str = "memory_recall";
pub const METHOD_LIST: &str = "memory_list";
pub const METHOD_STATS: &str = "memory_stats";
pub const METHOD_DELETE: &str = "memory_delete";

/// Strip a tool-result wrapper, if there is one.
///
/// Workers may answer with the value itself or with
/// `{"content":[{"text":"<json>"}]}`. In the latter case the first text item
/// is parsed as JSON; text that is not JSON comes back as a string value.
pub fn unwrap_payload(result: Value) -> Value {
    let text = result
        .get("content")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .and_then(|item| item.get("text"))
        .and_then(Value::as_str);

    match text {
        Some(text) => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
        }
        None => result,
    }
}

fn decode<T: DeserializeOwned>(method: &str, result: Value) -> Result<T, IpcError> {
    serde_json::from_value(unwrap_payload(result))
        .map_err(|e| IpcError::Protocol(format!("Unexpected {} result: {}", method, e)))
}

/// Pull the new entry's id out of a `memory_store` result.
fn stored_id(result: Value) -> Result<String, IpcError> {
    match unwrap_payload(result) {
        Value::String(id) => Ok(id),
        Value::Number(n) => Ok(n.to_string()),
        Value::Object(map) => match map.get("id") {
            Some(Value::String(id)) => Ok(id.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(IpcError::Protocol("memory_store result has no id".to_string())),
        },
        other => Err(IpcError::Protocol(format!("Unexpected memory_store result: {}", other))),
    }
}

impl RpcClient {
    /// Search memories. Returns an empty list on any failure.
    pub async fn search(&self, query: &str, limit: u32) -> Vec<MemoryEntry> {
        let params = json!({"query": query, "limit": limit});
        self.entries(METHOD_SEARCH, params).await
    }

    /// List the most recent memories. Returns an empty list on any failure.
    pub async fn list(&self, limit: u32) -> Vec<MemoryEntry> {
        self.entries(METHOD_LIST, json!({"limit": limit})).await
    }

    /// Fetch one memory by id.
    ///
    /// Returns `None` if the worker has no such entry or the call fails.
    pub async fn recall(&self, id: &str) -> Option<MemoryEntry> {
        let result = match self.call_default(METHOD_RECALL, json!({"id": id})).await {
            Ok(result) => result,
            Err(e) => {
                warn!("{} failed: {}", METHOD_RECALL, e);
                return None;
            }
        };

        match decode::<Option<MemoryEntry>>(METHOD_RECALL, result) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }

    /// Store a new memory and return its id.
    pub async fn store(&self, memory: &NewMemory) -> Result<String, IpcError> {
        let params = serde_json::to_value(memory)
            .map_err(|e| IpcError::Protocol(format!("Failed to serialize memory: {}", e)))?;
        let result = self.call_default(METHOD_STORE, params).await?;
        stored_id(result)
    }

    pub async fn get_stats(&self) -> Result<MemoryStats, IpcError> {
        let result = self.call_default(METHOD_STATS, json!({})).await?;
        decode(METHOD_STATS, result)
    }

    /// Delete a memory. The worker's result carries nothing of interest.
    pub async fn delete(&self, id: &str) -> Result<(), IpcError> {
        self.call_default(METHOD_DELETE, json!({"id": id})).await?;
        Ok(())
    }

    async fn entries(&self, method: &str, params: Value) -> Vec<MemoryEntry> {
        let result = match self.call_default(method, params).await {
            Ok(result) => result,
            Err(e) => {
                warn!("{} failed: {}", method, e);
                return Vec::new();
            }
        };

        decode(method, result).unwrap_or_else(|e| {
            warn!("{}", e);
            Vec::new()
        })
    }
}
