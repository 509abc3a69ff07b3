//! JSON-RPC envelopes exchanged with the worker.
//!
//! Requests and notifications are only ever serialized; responses are only
//! ever deserialized. The version tag is written as `protocol`, and the
//! conventional `jsonrpc` spelling is accepted on the way in.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::ipc::error::IpcError;

/// Version tag carried by every envelope.
pub const PROTOCOL_VERSION_TAG: &str = "2.0";

/// A request envelope. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct RequestEnvelope<'a> {
    pub protocol: &'static str,
    pub method: &'a str,
    pub params: &'a Value,
    pub id: u64,
}

impl<'a> RequestEnvelope<'a> {
    pub fn new(method: &'a str, params: &'a Value, id: u64) -> Self {
        Self {
            protocol: PROTOCOL_VERSION_TAG,
            method,
            params,
            id,
        }
    }

    /// Serialize to a single line of compact JSON.
    pub fn to_line(&self) -> Result<String, IpcError> {
        serde_json::to_string(self)
            .map_err(|e| IpcError::Protocol(format!("Failed to serialize request: {}", e)))
    }
}

/// A notification envelope (no `id`, no response expected).
#[derive(Debug, Clone, Serialize)]
pub struct NotificationEnvelope<'a> {
    pub protocol: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a Value>,
}

impl<'a> NotificationEnvelope<'a> {
    pub fn new(method: &'a str, params: Option<&'a Value>) -> Self {
        Self {
            protocol: PROTOCOL_VERSION_TAG,
            method,
            params,
        }
    }

    pub fn to_line(&self) -> Result<String, IpcError> {
        serde_json::to_string(self)
            .map_err(|e| IpcError::Protocol(format!("Failed to serialize notification: {}", e)))
    }
}

/// The `error` member of a response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A response envelope as received from the worker.
///
/// `result` distinguishes an absent member (`None`) from an explicit
/// `null` (`Some(Value::Null)`), so a method with no meaningful result can
/// still answer successfully.
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    pub protocol: Option<String>,
    pub id: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<RpcErrorObject>,
}

/// One decoded line from the worker.
#[derive(Debug, Clone)]
pub enum Incoming {
    /// An answer to one of our requests.
    Response(ResponseEnvelope),
    /// A notification or request initiated by the worker.
    WorkerMessage { method: String, id: Option<u64> },
}

/// Every member any incoming envelope may carry.
#[derive(Debug, Deserialize)]
struct RawIncoming {
    #[serde(default, alias = "jsonrpc")]
    protocol: Option<String>,
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

/// Keep an explicit `null` as `Some(Value::Null)`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Incoming {
    /// Decode and classify one framed line.
    ///
    /// A line with a `method` member is worker-initiated. Anything else must
    /// be a response carrying `result` or `error`; lines that are not JSON
    /// objects of this shape are rejected.
    pub fn decode(line: &str) -> Result<Self, IpcError> {
        let raw: RawIncoming = serde_json::from_str(line)
            .map_err(|e| IpcError::Decode(format!("{}: {}", e, truncate(line))))?;

        if let Some(method) = raw.method {
            return Ok(Incoming::WorkerMessage { method, id: raw.id });
        }

        if raw.result.is_none() && raw.error.is_none() {
            return Err(IpcError::Decode(format!(
                "response carries neither result nor error: {}",
                truncate(line)
            )));
        }

        Ok(Incoming::Response(ResponseEnvelope {
            protocol: raw.protocol,
            id: raw.id,
            result: raw.result,
            error: raw.error,
        }))
    }
}

impl ResponseEnvelope {
    /// Decode one framed line that must be a response.
    pub fn from_line(line: &str) -> Result<Self, IpcError> {
        match Incoming::decode(line)? {
            Incoming::Response(envelope) => Ok(envelope),
            Incoming::WorkerMessage { method, .. } => Err(IpcError::Decode(format!(
                "expected a response, got worker message `{}`",
                method
            ))),
        }
    }

    /// Collapse into the call outcome. `error` wins if both are present.
    pub fn into_outcome(self) -> Result<Value, IpcError> {
        match (self.error, self.result) {
            (Some(err), _) => Err(err.into()),
            (None, Some(result)) => Ok(result),
            (None, None) => Err(IpcError::Protocol(
                "Response missing both result and error".to_string(),
            )),
        }
    }
}

/// Clip a line for inclusion in a log message.
fn truncate(line: &str) -> &str {
    const MAX: usize = 200;
    if line.len() <= MAX {
        return line;
    }
    let mut end = MAX;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let params = json!({"query": "foo", "limit": 20});
        let line = RequestEnvelope::new("memory_search", &params, 7)
            .to_line()
            .unwrap();

        assert_eq!(
            line,
            r#"{"protocol":"2.0","method":"memory_search","params":{"limit":20,"query":"foo"},"id":7}"#
        );
    }

    #[test]
    fn test_notification_has_no_id() {
        let line = NotificationEnvelope::new("notifications/initialized", None)
            .to_line()
            .unwrap();

        assert_eq!(
            line,
            r#"{"protocol":"2.0","method":"notifications/initialized"}"#
        );
    }

    #[test]
    fn test_decode_success_response() {
        let envelope =
            ResponseEnvelope::from_line(r#"{"protocol":"2.0","id":1,"result":{"ok":true}}"#)
                .unwrap();

        assert_eq!(envelope.id, Some(1));
        assert_eq!(envelope.into_outcome().unwrap(), json!({"ok": true}));
    }

    #[test]
    fn test_decode_accepts_jsonrpc_tag() {
        let envelope =
            ResponseEnvelope::from_line(r#"{"jsonrpc":"2.0","id":3,"result":[]}"#).unwrap();

        assert_eq!(envelope.protocol.as_deref(), Some("2.0"));
        assert_eq!(envelope.id, Some(3));
    }

    #[test]
    fn test_decode_null_result_is_success() {
        let envelope =
            ResponseEnvelope::from_line(r#"{"protocol":"2.0","id":2,"result":null}"#).unwrap();

        assert_eq!(envelope.into_outcome().unwrap(), Value::Null);
    }

    #[test]
    fn test_decode_error_response() {
        let envelope = ResponseEnvelope::from_line(
            r#"{"protocol":"2.0","id":4,"error":{"code":-32602,"message":"Invalid params"}}"#,
        )
        .unwrap();

        match envelope.into_outcome() {
            Err(IpcError::Remote { code, message, .. }) => {
                assert_eq!(code, -32602);
                assert_eq!(message, "Invalid params");
            }
            other => panic!("Expected Remote error, got {:?}", other),
        }
    }

    #[test]
    fn test_error_wins_when_both_present() {
        let envelope = ResponseEnvelope::from_line(
            r#"{"protocol":"2.0","id":5,"result":1,"error":{"code":1,"message":"bad"}}"#,
        )
        .unwrap();

        assert!(matches!(
            envelope.into_outcome(),
            Err(IpcError::Remote { code: 1, .. })
        ));
    }

    #[test]
    fn test_rejects_envelope_without_result_or_error() {
        let err = ResponseEnvelope::from_line(r#"{"protocol":"2.0","id":6}"#).unwrap_err();
        assert!(matches!(err, IpcError::Decode(_)));
    }

    #[test]
    fn test_rejects_non_json_line() {
        let err = ResponseEnvelope::from_line("Traceback (most recent call last):").unwrap_err();
        assert!(matches!(err, IpcError::Decode(_)));
    }

    #[test]
    fn test_worker_notification_is_classified() {
        let incoming =
            Incoming::decode(r#"{"protocol":"2.0","method":"log","params":{"level":"info"}}"#)
                .unwrap();

        match incoming {
            Incoming::WorkerMessage { method, id } => {
                assert_eq!(method, "log");
                assert_eq!(id, None);
            }
            other => panic!("Expected WorkerMessage, got {:?}", other),
        }
        assert!(ResponseEnvelope::from_line(r#"{"method":"log"}"#).is_err());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let line = "\u{e9}".repeat(150);
        let clipped = truncate(&line);

        assert!(clipped.len() <= 200);
        assert!(line.starts_with(clipped));
    }
}
