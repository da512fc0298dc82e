//! JSON-RPC 2.0 wire shapes for the LSP side of the house.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Envelope, RequestId, Response, ResponseError};

/// Cancel notification method defined by the LSP base protocol.
pub const CANCEL_METHOD: &str = "$/cancelRequest";

/// Error codes reserved by JSON-RPC 2.0 and the LSP base protocol.
/// https://www.jsonrpc.org/specification#error_object
pub mod error_codes {
    /// Parse error - Invalid JSON was received by the server
    pub const PARSE_ERROR: i64 = -32700;

    /// Invalid Request - The JSON sent is not a valid Request object
    pub const INVALID_REQUEST: i64 = -32600;

    /// Method not found - The method does not exist / is not available
    pub const METHOD_NOT_FOUND: i64 = -32601;

    /// Invalid params - Invalid method parameter(s)
    pub const INVALID_PARAMS: i64 = -32602;

    /// Internal error - Internal JSON-RPC error
    pub const INTERNAL_ERROR: i64 = -32603;

    /// The request was cancelled before a result was produced
    pub const REQUEST_CANCELLED: i64 = -32800;

    /// The result would be stale; the document changed underneath
    pub const CONTENT_MODIFIED: i64 = -32801;
}

/// JSON-RPC 2.0 message as written to the wire. Requests, notifications and
/// responses all share this record; absent fields are skipped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireMessage {
    /// MUST be exactly "2.0"
    pub jsonrpc: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<ResponseError> for WireError {
    fn from(err: ResponseError) -> Self {
        Self {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

impl From<WireError> for ResponseError {
    fn from(err: WireError) -> Self {
        Self {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

fn blank() -> WireMessage {
    WireMessage {
        jsonrpc: "2.0".to_string(),
        id: None,
        method: None,
        params: None,
        result: None,
        error: None,
    }
}

/// Serialise an envelope to its JSON-RPC 2.0 wire value.
pub fn encode(envelope: &Envelope) -> Value {
    let mut wire = blank();
    match envelope {
        Envelope::Request(req) => {
            wire.id = Some(req.id.clone());
            wire.method = Some(req.method.clone());
            wire.params = req.params.clone();
        }
        Envelope::Notification(notif) => {
            wire.method = Some(notif.method.clone());
            wire.params = notif.params.clone();
        }
        Envelope::Response(resp) => {
            wire.id = Some(resp.id.clone());
            match &resp.result {
                Ok(result) => wire.result = Some(result.clone()),
                Err(err) => wire.error = Some(err.clone().into()),
            }
        }
    }
    serde_json::to_value(wire).expect("wire message serialization is infallible")
}

/// Bare error response with a null id, used when a frame cannot even be
/// parsed far enough to recover the request id.
pub fn null_id_error(code: i64, message: impl Into<String>) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": null,
        "error": { "code": code, "message": message.into() },
    })
}

/// Error response for a recovered id.
pub fn error_response(id: RequestId, code: i64, message: impl Into<String>) -> Response {
    Response::error(id, ResponseError::new(code, message))
}
