//! Debug Adapter Protocol wire shapes.
//!
//! DAP frames identically to LSP but the envelope differs: every message
//! carries `seq` and a `type` discriminator, responses reference the
//! request by `request_seq` and echo its `command`, and errors are a
//! `success: false` response with a human-readable `message`.

use serde::Serialize;
use serde_json::Value;

use super::{Envelope, ResponseError};
use crate::correlation::IdAllocator;

/// Cancel command defined by the DAP specification. On the wire it is a
/// request, but the engine treats an incoming one like a sentinel
/// notification: it never reaches user handlers.
pub const CANCEL_COMMAND: &str = "cancel";

/// Error id used for failed handlers when the connection runs in
/// 500-compatibility mode. Unknown commands and undecodable arguments
/// reuse the JSON-RPC codes either way.
pub const HTTP_ERROR_CODE: i64 = 500;

#[derive(Debug, Serialize)]
struct WireRequest {
    seq: i64,
    #[serde(rename = "type")]
    kind: &'static str,
    command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<Value>,
}

#[derive(Debug, Serialize)]
struct WireEvent {
    seq: i64,
    #[serde(rename = "type")]
    kind: &'static str,
    event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<Value>,
}

#[derive(Debug, Serialize)]
struct WireResponse {
    seq: i64,
    #[serde(rename = "type")]
    kind: &'static str,
    request_seq: i64,
    success: bool,
    command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<Value>,
}

/// Body of a failed response: `{"error": {"id": code, "format": message}}`.
fn error_body(err: &ResponseError) -> Value {
    let mut error = serde_json::json!({
        "id": err.code,
        "format": err.message,
    });
    if let Some(data) = &err.data {
        error["data"] = data.clone();
    }
    serde_json::json!({ "error": error })
}

/// Serialise an envelope to its DAP wire value.
///
/// Requests carry the seq their id was allocated with; responses and events
/// are stamped from the same shared counter at encode time, so `seq` stays
/// monotonic across all outgoing traffic on a connection.
pub fn encode(envelope: &Envelope, seq: &IdAllocator) -> Value {
    let value = match envelope {
        Envelope::Request(req) => serde_json::to_value(WireRequest {
            seq: req.id.as_number().unwrap_or_else(|| seq.allocate()),
            kind: "request",
            command: req.method.clone(),
            arguments: req.params.clone(),
        }),
        Envelope::Notification(notif) if notif.method == CANCEL_COMMAND => {
            // Outgoing cancellation is a real request on the DAP wire. Its
            // response, if any, has no waiter and gets dropped on receipt.
            serde_json::to_value(WireRequest {
                seq: seq.allocate(),
                kind: "request",
                command: CANCEL_COMMAND.to_string(),
                arguments: notif.params.clone(),
            })
        }
        Envelope::Notification(notif) => serde_json::to_value(WireEvent {
            seq: seq.allocate(),
            kind: "event",
            event: notif.method.clone(),
            body: notif.params.clone(),
        }),
        Envelope::Response(resp) => {
            let command = resp.command.clone().unwrap_or_default();
            let request_seq = resp.id.as_number().unwrap_or(0);
            let wire = match &resp.result {
                Ok(body) => WireResponse {
                    seq: seq.allocate(),
                    kind: "response",
                    request_seq,
                    success: true,
                    command,
                    message: None,
                    body: if body.is_null() { None } else { Some(body.clone()) },
                },
                Err(err) => WireResponse {
                    seq: seq.allocate(),
                    kind: "response",
                    request_seq,
                    success: false,
                    command,
                    message: Some(err.message.clone()),
                    body: Some(error_body(err)),
                },
            };
            serde_json::to_value(wire)
        }
    };
    value.expect("wire message serialization is infallible")
}
