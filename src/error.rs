use serde_json::Value;

use crate::message::ResponseError;

/// Result type for engine operations
pub type RpcResult<T> = Result<T, RpcError>;

/// Connection-level error types
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed frame headers or truncated payload. The receive loop logs
    /// these and keeps going.
    #[error("framing error: {0}")]
    Framing(String),

    /// The peer closed its end of the stream.
    #[error("stream closed")]
    StreamClosed,

    /// The connection was torn down while the operation was in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// The request was cancelled, either by the caller or because the
    /// connection shut down. Distinguishable from a peer-reported error.
    #[error("request cancelled")]
    Cancelled,

    #[error("request timed out")]
    Timeout,

    /// The peer answered with an error response.
    #[error("peer error [{}]: {}", .0.code, .0.message)]
    Peer(ResponseError),

    #[error("handler already registered for method '{0}'")]
    DuplicateHandler(String),

    #[error("connection is not open")]
    NotConnected,

    #[error("connection was already started")]
    AlreadyConnected,
}

impl RpcError {
    /// True for the variants that terminate a send/receive loop. Everything
    /// else is logged and the loop continues.
    pub fn is_transport(&self) -> bool {
        matches!(self, RpcError::Io(_) | RpcError::StreamClosed)
    }
}

/// Error returned by user handler code, turned into a response error by the
/// router (`InternalError` unless the handler picked a code).
#[derive(Debug, Clone)]
pub struct HandlerError {
    pub code: Option<i64>,
    pub message: String,
    pub data: Option<Value>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_code(code: i64, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_terminate_loops() {
        assert!(RpcError::StreamClosed.is_transport());
        assert!(RpcError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe")).is_transport());
        assert!(!RpcError::Framing("bad header".into()).is_transport());
        assert!(!RpcError::Cancelled.is_transport());
    }

    #[test]
    fn handler_error_display_uses_message() {
        let err = HandlerError::new("index out of date");
        assert_eq!(err.to_string(), "index out of date");
        assert!(err.code.is_none());

        let err = HandlerError::with_code(-32099, "backend busy");
        assert_eq!(err.code, Some(-32099));
    }
}
