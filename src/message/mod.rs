//! Dialect-neutral message model.
//!
//! Both wire dialects (JSON-RPC 2.0 for LSP, the DAP envelope) decode into
//! the same three shapes: request, notification/event, response. The engine
//! routes these; payloads stay opaque JSON until a handler's deserialiser
//! runs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod dap;
pub mod lsp;

/// Request identifier. LSP allows integers and strings; DAP uses the
/// integer `seq`. Outgoing ids are always numeric and monotonic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    pub fn as_number(&self) -> Option<i64> {
        match self {
            RequestId::Number(n) => Some(*n),
            RequestId::String(_) => None,
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{}", s),
        }
    }
}

/// A call that expects a response.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

/// Fire-and-forget message. Carries LSP notifications and DAP events alike.
#[derive(Debug, Clone)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

/// Error half of a response. `code` uses the JSON-RPC table for LSP; for
/// DAP it lands in the structured error body.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl ResponseError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Result of a request, inbound or outbound. `result` and the error are
/// mutually exclusive by construction.
#[derive(Debug, Clone)]
pub struct Response {
    pub id: RequestId,
    /// Command echo, required on the DAP wire. Unused for LSP.
    pub command: Option<String>,
    pub result: Result<Value, ResponseError>,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            command: None,
            result: Ok(result),
        }
    }

    pub fn error(id: RequestId, error: ResponseError) -> Self {
        Self {
            id,
            command: None,
            result: Err(error),
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }
}

/// The outer message shape. Every wire message is exactly one of these.
#[derive(Debug, Clone)]
pub enum Envelope {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

impl Envelope {
    /// Short description for log lines.
    pub fn describe(&self) -> String {
        match self {
            Envelope::Request(r) => format!("request {} (id={})", r.method, r.id),
            Envelope::Notification(n) => format!("notification {}", n.method),
            Envelope::Response(r) => format!("response (id={})", r.id),
        }
    }
}

/// Which wire dialect a connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Lsp,
    Dap,
}

impl Dialect {
    /// Method/command name of the cancel sentinel for this dialect.
    pub fn cancel_method(&self) -> &'static str {
        match self {
            Dialect::Lsp => lsp::CANCEL_METHOD,
            Dialect::Dap => dap::CANCEL_COMMAND,
        }
    }

    /// Extract the target request id from a cancel sentinel's payload.
    pub fn cancel_target(&self, params: Option<&Value>) -> Option<RequestId> {
        let params = params?;
        let raw = match self {
            Dialect::Lsp => params.get("id")?,
            Dialect::Dap => params.get("requestId")?,
        };
        serde_json::from_value(raw.clone()).ok()
    }

    /// Build the best-effort cancel message for an outgoing request we are
    /// abandoning. LSP cancels with a notification; DAP cancel is itself a
    /// request, sent fire-and-forget here.
    pub fn cancel_envelope(&self, id: &RequestId) -> Envelope {
        match self {
            Dialect::Lsp => Envelope::Notification(Notification {
                method: lsp::CANCEL_METHOD.to_string(),
                params: Some(serde_json::json!({ "id": id })),
            }),
            Dialect::Dap => Envelope::Notification(Notification {
                method: dap::CANCEL_COMMAND.to_string(),
                params: Some(serde_json::json!({ "requestId": id })),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_id_accepts_both_shapes() {
        let n: RequestId = serde_json::from_value(json!(7)).unwrap();
        assert_eq!(n, RequestId::Number(7));
        assert_eq!(n.as_number(), Some(7));

        let s: RequestId = serde_json::from_value(json!("7")).unwrap();
        assert_eq!(s, RequestId::String("7".to_string()));
        assert_eq!(s.as_number(), None);
    }

    #[test]
    fn request_id_serializes_untagged() {
        assert_eq!(serde_json::to_value(RequestId::Number(3)).unwrap(), json!(3));
        assert_eq!(
            serde_json::to_value(RequestId::String("a".into())).unwrap(),
            json!("a")
        );
    }

    #[test]
    fn cancel_target_per_dialect() {
        let lsp = Dialect::Lsp.cancel_target(Some(&json!({ "id": 5 })));
        assert_eq!(lsp, Some(RequestId::Number(5)));

        let dap = Dialect::Dap.cancel_target(Some(&json!({ "requestId": 5 })));
        assert_eq!(dap, Some(RequestId::Number(5)));

        assert_eq!(Dialect::Lsp.cancel_target(None), None);
        assert_eq!(Dialect::Lsp.cancel_target(Some(&json!({}))), None);
    }
}
