//! Classifies parsed JSON values into inbound engine messages.
//!
//! The receiver sits between the framing codec and the dispatch loop: it
//! takes one decoded JSON value and says what it is. Nothing here touches
//! handler payload types; params stay opaque.

use serde_json::Value;

use crate::message::{lsp, Dialect, Notification, Request, RequestId, Response, ResponseError};

/// One classified inbound item.
#[derive(Debug, Clone)]
pub enum Inbound {
    Request(Request),
    Notification(Notification),
    Response(Response),
    /// The value was not a well-formed message. The router answers these
    /// with `InvalidRequest`, echoing the id when one could be recovered.
    Invalid {
        id: Option<RequestId>,
        reason: String,
    },
}

impl Inbound {
    fn invalid(id: Option<RequestId>, reason: &str) -> Self {
        Inbound::Invalid {
            id,
            reason: reason.to_string(),
        }
    }
}

/// Validator for one wire dialect.
#[derive(Debug, Clone, Copy)]
pub struct Receiver {
    dialect: Dialect,
}

impl Receiver {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    /// Classify a top-level JSON value. A JSON-RPC batch yields one item
    /// per element, in order; everything else yields exactly one item.
    pub fn classify(&self, value: Value) -> Vec<Inbound> {
        match self.dialect {
            Dialect::Lsp => match value {
                Value::Array(items) => {
                    if items.is_empty() {
                        vec![Inbound::invalid(None, "Empty batch")]
                    } else {
                        items.into_iter().map(classify_lsp).collect()
                    }
                }
                other => vec![classify_lsp(other)],
            },
            Dialect::Dap => vec![classify_dap(value)],
        }
    }
}

fn recover_id(value: &Value) -> Option<RequestId> {
    value
        .get("id")
        .and_then(|raw| serde_json::from_value(raw.clone()).ok())
}

fn classify_lsp(value: Value) -> Inbound {
    let Value::Object(_) = &value else {
        return Inbound::invalid(None, "Not a message object");
    };

    let id = recover_id(&value);

    if value.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Inbound::invalid(id, "Unexpected protocol");
    }

    // An id together with a result or error makes this a response to one
    // of our requests, before any method checks apply.
    if id.is_some() && (value.get("result").is_some() || value.get("error").is_some()) {
        return classify_lsp_response(id.unwrap(), &value);
    }

    let method = match value.get("method").and_then(Value::as_str) {
        Some(m) if !m.trim().is_empty() => m.to_string(),
        _ => return Inbound::invalid(id, "Method not set"),
    };

    let params = value.get("params").cloned();
    if let Some(p) = &params {
        if !p.is_array() && !p.is_object() && !p.is_null() {
            return Inbound::invalid(id, "Invalid params");
        }
    }

    match id {
        Some(id) => Inbound::Request(Request { id, method, params }),
        None => Inbound::Notification(Notification { method, params }),
    }
}

fn classify_lsp_response(id: RequestId, value: &Value) -> Inbound {
    if let Some(raw) = value.get("error").filter(|raw| !raw.is_null()) {
        match serde_json::from_value::<lsp::WireError>(raw.clone()) {
            Ok(err) => Inbound::Response(Response::error(id, err.into())),
            Err(_) => Inbound::invalid(Some(id), "Malformed error object"),
        }
    } else {
        let result = value.get("result").cloned().unwrap_or(Value::Null);
        Inbound::Response(Response::success(id, result))
    }
}

fn classify_dap(value: Value) -> Inbound {
    let Value::Object(_) = &value else {
        return Inbound::invalid(None, "Not a message object");
    };

    match value.get("type").and_then(Value::as_str) {
        Some("request") => {
            let Some(seq) = value.get("seq").and_then(Value::as_i64) else {
                return Inbound::invalid(None, "Request without seq");
            };
            let Some(command) = value.get("command").and_then(Value::as_str) else {
                return Inbound::invalid(Some(RequestId::Number(seq)), "Request without command");
            };
            Inbound::Request(Request {
                id: RequestId::Number(seq),
                method: command.to_string(),
                params: value.get("arguments").cloned(),
            })
        }
        Some("event") => {
            let Some(event) = value.get("event").and_then(Value::as_str) else {
                return Inbound::invalid(None, "Event without name");
            };
            Inbound::Notification(Notification {
                method: event.to_string(),
                params: value.get("body").cloned(),
            })
        }
        Some("response") => {
            let Some(request_seq) = value.get("request_seq").and_then(Value::as_i64) else {
                return Inbound::invalid(None, "Response without request_seq");
            };
            let id = RequestId::Number(request_seq);
            let command = value.get("command").and_then(Value::as_str).unwrap_or("");
            let response = if value.get("success").and_then(Value::as_bool) == Some(true) {
                Response::success(id, value.get("body").cloned().unwrap_or(Value::Null))
            } else {
                Response::error(id, dap_response_error(&value))
            };
            Inbound::Response(response.with_command(command))
        }
        _ => Inbound::invalid(None, "Unknown message type"),
    }
}

fn dap_response_error(value: &Value) -> ResponseError {
    let error = value.get("body").and_then(|b| b.get("error"));
    let code = error
        .and_then(|e| e.get("id"))
        .and_then(Value::as_i64)
        .unwrap_or(lsp::error_codes::INTERNAL_ERROR);
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.and_then(|e| e.get("format")).and_then(Value::as_str))
        .unwrap_or("request failed")
        .to_string();
    let data = error.and_then(|e| e.get("data")).cloned();
    ResponseError {
        code,
        message,
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lsp() -> Receiver {
        Receiver::new(Dialect::Lsp)
    }

    fn dap() -> Receiver {
        Receiver::new(Dialect::Dap)
    }

    #[test]
    fn empty_object_is_unexpected_protocol() {
        let got = lsp().classify(json!({}));
        assert!(matches!(
            &got[..],
            [Inbound::Invalid { reason, .. }] if reason == "Unexpected protocol"
        ));
    }

    #[test]
    fn empty_batch_is_invalid() {
        let got = lsp().classify(json!([]));
        assert!(matches!(&got[..], [Inbound::Invalid { .. }]));
    }

    #[test]
    fn scalar_top_level_is_invalid() {
        let got = lsp().classify(json!(42));
        assert!(matches!(
            &got[..],
            [Inbound::Invalid { reason, .. }] if reason == "Not a message object"
        ));
    }

    #[test]
    fn blank_method_is_invalid() {
        let got = lsp().classify(json!({"jsonrpc": "2.0", "id": 1, "method": "  "}));
        assert!(matches!(
            &got[..],
            [Inbound::Invalid { id: Some(RequestId::Number(1)), reason }] if reason == "Method not set"
        ));
    }

    #[test]
    fn scalar_params_is_invalid() {
        let got = lsp().classify(json!({"jsonrpc": "2.0", "method": "m", "params": 3}));
        assert!(matches!(
            &got[..],
            [Inbound::Invalid { reason, .. }] if reason == "Invalid params"
        ));
    }

    #[test]
    fn request_notification_and_response() {
        let got = lsp().classify(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}));
        assert!(matches!(&got[..], [Inbound::Request(r)] if r.method == "ping"));

        let got = lsp().classify(json!({"jsonrpc": "2.0", "method": "ping"}));
        assert!(matches!(&got[..], [Inbound::Notification(n)] if n.method == "ping"));

        let got = lsp().classify(json!({"jsonrpc": "2.0", "id": 1, "result": "pong"}));
        assert!(matches!(
            &got[..],
            [Inbound::Response(r)] if r.result == Ok(json!("pong"))
        ));

        let got = lsp().classify(json!({
            "jsonrpc": "2.0", "id": 1,
            "error": {"code": -32601, "message": "unknown"},
        }));
        match &got[..] {
            [Inbound::Response(r)] => {
                let err = r.result.as_ref().unwrap_err();
                assert_eq!(err.code, -32601);
                assert_eq!(err.message, "unknown");
            }
            other => panic!("unexpected classification: {:?}", other),
        }
    }

    /// The JSON-RPC 2.0 specification's example batch, classified in order.
    #[test]
    fn specification_example_batch() {
        let batch = json!([
            {"jsonrpc": "2.0", "method": "sum", "params": [1, 2, 4], "id": "1"},
            {"jsonrpc": "2.0", "method": "notify_hello", "params": [7]},
            {"jsonrpc": "2.0", "method": "subtract", "params": [42, 23], "id": "2"},
            {"foo": "boo"},
            {"jsonrpc": "2.0", "method": "foo.get", "params": {"name": "myself"}, "id": "5"},
            {"jsonrpc": "2.0", "method": "get_data", "id": "9"},
        ]);

        let got = lsp().classify(batch);
        assert_eq!(got.len(), 6);
        assert!(matches!(&got[0], Inbound::Request(r) if r.method == "sum"));
        assert!(matches!(&got[1], Inbound::Notification(n) if n.method == "notify_hello"));
        assert!(matches!(&got[2], Inbound::Request(r) if r.method == "subtract"));
        assert!(
            matches!(&got[3], Inbound::Invalid { reason, .. } if reason == "Unexpected protocol")
        );
        assert!(matches!(&got[4], Inbound::Request(r) if r.method == "foo.get"));
        assert!(matches!(&got[5], Inbound::Request(r) if r.method == "get_data"));
    }

    #[test]
    fn dap_request_event_response() {
        let got = dap().classify(json!({
            "seq": 3, "type": "request", "command": "threads",
        }));
        assert!(matches!(
            &got[..],
            [Inbound::Request(r)] if r.method == "threads" && r.id == RequestId::Number(3)
        ));

        let got = dap().classify(json!({"seq": 7, "type": "event", "event": "initialized"}));
        match &got[..] {
            [Inbound::Notification(n)] => {
                assert_eq!(n.method, "initialized");
                assert_eq!(n.params, None);
            }
            other => panic!("unexpected classification: {:?}", other),
        }

        let got = dap().classify(json!({
            "seq": 9, "type": "response", "request_seq": 2, "success": true,
            "command": "threads", "body": {"threads": []},
        }));
        assert!(matches!(
            &got[..],
            [Inbound::Response(r)] if r.id == RequestId::Number(2) && r.result.is_ok()
        ));
    }

    #[test]
    fn dap_failed_response_carries_error_body() {
        let got = dap().classify(json!({
            "seq": 9, "type": "response", "request_seq": 2, "success": false,
            "command": "evaluate", "message": "boom",
            "body": {"error": {"id": 500, "format": "boom"}},
        }));
        match &got[..] {
            [Inbound::Response(r)] => {
                let err = r.result.as_ref().unwrap_err();
                assert_eq!(err.code, 500);
                assert_eq!(err.message, "boom");
            }
            other => panic!("unexpected classification: {:?}", other),
        }
    }

    #[test]
    fn dap_unknown_type_is_invalid() {
        let got = dap().classify(json!({"seq": 1, "type": "banana"}));
        assert!(matches!(&got[..], [Inbound::Invalid { .. }]));
    }
}
