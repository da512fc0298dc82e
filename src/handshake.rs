//! Initialise handshakes.
//!
//! LSP: the client sends `initialize`, awaits the result, then fires the
//! `initialized` notification. DAP mirrors it with an `initialize` request
//! answered by the adapter, which then raises the `initialized` event.
//! Either way the connection is ready only after the exchange; ordinary
//! requests issued earlier queue behind [`Connection::ready`].

use serde_json::{json, Value};

use crate::connection::{Connection, INITIALIZE_METHOD};
use crate::error::RpcResult;

impl Connection {
    /// Run the client side of the LSP handshake. Applies the server's
    /// capability record to registered capability setters, announces
    /// `initialized`, and marks the connection ready.
    pub async fn initialize_lsp(&self, params: Value) -> RpcResult<Value> {
        let result = self.handshake_request(INITIALIZE_METHOD, Some(params)).await?;
        if let Some(capabilities) = result.get("capabilities") {
            self.apply_peer_capabilities(capabilities);
        }
        self.send_notification("initialized", Some(json!({}))).await?;
        self.mark_ready();
        log::debug!("LSP handshake complete");
        Ok(result)
    }

    /// Run the client side of the DAP handshake. The response body is the
    /// adapter's capability record; readiness comes from the adapter's
    /// `initialized` event, which this waits for.
    pub async fn initialize_dap(&self, arguments: Value) -> RpcResult<Value> {
        let body = self
            .handshake_request(INITIALIZE_METHOD, Some(arguments))
            .await?;
        if !body.is_null() {
            self.apply_peer_capabilities(&body);
        }
        self.ready().await?;
        log::debug!("DAP handshake complete");
        Ok(body)
    }

    /// Server side: push every dynamic registration to the peer via
    /// `client/registerCapability`. Queues until the handshake finished.
    pub async fn register_capabilities(&self) -> RpcResult<()> {
        let registrations = self.registry().dynamic_registrations();
        if registrations.is_empty() {
            return Ok(());
        }
        log::debug!("registering {} dynamic capabilities", registrations.len());
        self.send_request(
            "client/registerCapability",
            Some(json!({ "registrations": registrations })),
            None,
        )
        .await
        .map(|_| ())
    }
}
