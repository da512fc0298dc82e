//! Handler-facing seams.
//!
//! Handlers never touch the connection directly; they get a [`Peer`]
//! handle that can only send, plus a cancellation token linked to the
//! connection's root. This keeps the connection -> dispatcher -> handler
//! -> connection cycle broken at a narrow interface.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::RpcResult;

/// The opposite endpoint on a connection, as visible to handlers.
#[async_trait]
pub trait Peer: Send + Sync {
    /// Send a request and wait for the matching response. A cancellation
    /// token abandons the request locally and tells the peer best-effort.
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: Option<CancellationToken>,
    ) -> RpcResult<Value>;

    /// Fire-and-forget notification (LSP) or event (DAP).
    async fn send_notification(&self, method: &str, params: Option<Value>) -> RpcResult<()>;

    /// The handler registry behind this connection, for dynamic
    /// registration from inside handlers.
    fn registry(&self) -> Arc<crate::registry::HandlerRegistry>;
}

/// Context handed to every handler invocation.
#[derive(Clone)]
pub struct RequestContext {
    /// Trips when the peer cancels this request or the connection shuts
    /// down. Long-running handlers should poll or select on it.
    pub cancel: CancellationToken,
    /// Send-only handle back to the peer.
    pub peer: Arc<dyn Peer>,
}
