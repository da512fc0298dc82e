//! Connection driver: owns the send, receive and dispatch loops.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::correlation::{CorrelationTable, IdAllocator};
use crate::error::{RpcError, RpcResult};
use crate::framing::{FrameReader, FrameWriter};
use crate::handler::Peer;
use crate::message::lsp::error_codes;
use crate::message::{dap, lsp, Dialect, Envelope, Request};
use crate::receiver::{Inbound, Receiver};
use crate::registry::HandlerRegistry;
use crate::router::{Executions, Router};
use crate::scheduler::Scheduler;

/// First request of the handshake in both dialects. It bypasses the ready
/// gate; everything else waits for the handshake to finish.
pub(crate) const INITIALIZE_METHOD: &str = "initialize";

/// Items travelling through the outgoing queue. `Raw` carries the bare
/// null-id error responses that have no envelope form; `Flush` acks once
/// everything enqueued before it has been written.
pub(crate) enum Outgoing {
    Message(Envelope),
    Raw(Value),
    Flush(oneshot::Sender<()>),
}

/// Connection lifecycle. `Draining` only exists inside `disconnect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Open,
    Draining,
    Closed,
}

/// Tuning knobs, built per dialect and adjusted as needed.
#[derive(Clone)]
pub struct ConnectionOptions {
    pub dialect: Dialect,
    /// Bound on waiting for the outgoing queue to drain in
    /// `disconnect(flush)`.
    pub flush_timeout: Duration,
    pub outgoing_capacity: usize,
    /// Bound on waiting for outstanding handler tasks at scheduler
    /// shutdown.
    pub scheduler_grace: Duration,
    /// Failed DAP handlers answer with error id 500 instead of -32603.
    /// Some clients only look at `success`/`message`; others validate the
    /// code, so both modes exist.
    pub dap_http_error_code: bool,
    /// When false the connection is ready immediately after `connect`,
    /// with no initialise handshake expected.
    pub require_handshake: bool,
}

impl ConnectionOptions {
    pub fn lsp() -> Self {
        Self {
            dialect: Dialect::Lsp,
            flush_timeout: crate::defaults::FLUSH_TIMEOUT,
            outgoing_capacity: crate::defaults::OUTGOING_QUEUE_CAPACITY,
            scheduler_grace: crate::defaults::SCHEDULER_GRACE,
            dap_http_error_code: false,
            require_handshake: true,
        }
    }

    pub fn dap() -> Self {
        Self {
            dialect: Dialect::Dap,
            dap_http_error_code: true,
            ..Self::lsp()
        }
    }

    pub fn without_handshake(mut self) -> Self {
        self.require_handshake = false;
        self
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::lsp()
    }
}

/// One bidirectional connection over a byte-stream pair.
pub struct Connection {
    options: ConnectionOptions,
    state: Mutex<ConnectionState>,
    registry: Arc<HandlerRegistry>,
    correlation: Arc<CorrelationTable>,
    ids: Arc<IdAllocator>,
    peer: Arc<PeerHandle>,
    scheduler: Arc<Scheduler>,
    /// Root of every per-request cancellation source; cancelled on
    /// disconnect, tearing down all handler work.
    root_cancel: CancellationToken,
    /// Stops frame reading first so draining accepts no new inbound work.
    inbound_cancel: CancellationToken,
    /// Trips once the connection is fully torn down (or the transport
    /// failed underneath us).
    disconnected: CancellationToken,
    ready: Arc<watch::Sender<bool>>,
    outgoing_tx: mpsc::Sender<Outgoing>,
    outgoing_rx: Mutex<Option<mpsc::Receiver<Outgoing>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    pub fn new(options: ConnectionOptions) -> Arc<Self> {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(options.outgoing_capacity);
        let ids = Arc::new(IdAllocator::new());
        let correlation = Arc::new(CorrelationTable::new(ids.clone()));
        let registry = HandlerRegistry::new();
        let root_cancel = CancellationToken::new();
        let (ready, _) = watch::channel(false);
        let ready = Arc::new(ready);

        let peer = Arc::new(PeerHandle {
            dialect: options.dialect,
            outgoing: outgoing_tx.clone(),
            correlation: correlation.clone(),
            registry: registry.clone(),
            ready: ready.clone(),
            root_cancel: root_cancel.clone(),
        });

        Arc::new(Self {
            scheduler: Arc::new(Scheduler::new(options.scheduler_grace)),
            state: Mutex::new(ConnectionState::New),
            registry,
            correlation,
            ids,
            peer,
            inbound_cancel: root_cancel.child_token(),
            root_cancel,
            disconnected: CancellationToken::new(),
            ready,
            outgoing_tx,
            outgoing_rx: Mutex::new(Some(outgoing_rx)),
            tasks: Mutex::new(Vec::new()),
            options,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn registry(&self) -> Arc<HandlerRegistry> {
        self.registry.clone()
    }

    /// Send-only handle safe to hand to handlers and helpers.
    pub fn peer(&self) -> Arc<dyn Peer> {
        self.peer.clone()
    }

    /// Start the three loops over the given stream pair. Must be called on
    /// a runtime; moves the connection from `New` to `Open`.
    pub fn connect<R, W>(self: &Arc<Self>, reader: R, writer: W) -> RpcResult<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        {
            let mut state = self.state.lock().unwrap();
            if *state != ConnectionState::New {
                return Err(RpcError::AlreadyConnected);
            }
            *state = ConnectionState::Open;
        }

        let outgoing_rx = self
            .outgoing_rx
            .lock()
            .unwrap()
            .take()
            .expect("outgoing receiver consumed once, guarded by the state machine");

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let router = Router {
            dialect: self.options.dialect,
            dap_http_error_code: self.options.dap_http_error_code,
            registry: self.registry.clone(),
            scheduler: self.scheduler.clone(),
            correlation: self.correlation.clone(),
            outgoing: self.outgoing_tx.clone(),
            executions: Executions::default(),
            root_cancel: self.root_cancel.clone(),
            peer: self.peer.clone(),
            ready: self.ready.clone(),
        };

        let send = tokio::spawn(send_loop(
            writer,
            outgoing_rx,
            self.options.dialect,
            self.ids.clone(),
            self.root_cancel.clone(),
            self.correlation.clone(),
            self.disconnected.clone(),
        ));
        let receive = tokio::spawn(receive_loop(
            reader,
            Receiver::new(self.options.dialect),
            incoming_tx,
            self.outgoing_tx.clone(),
            self.options.dialect,
            self.correlation.clone(),
            self.inbound_cancel.clone(),
            self.disconnected.clone(),
        ));
        let dispatch = tokio::spawn(dispatch_loop(
            incoming_rx,
            router,
            self.root_cancel.clone(),
        ));

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(send);
        tasks.push(receive);
        tasks.push(dispatch);

        if !self.options.require_handshake {
            self.ready.send_replace(true);
        }

        log::debug!("connection open");
        Ok(())
    }

    /// Send a request and await the matching response.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: Option<CancellationToken>,
    ) -> RpcResult<Value> {
        self.check_open()?;
        self.peer.send_request(method, params, cancel).await
    }

    /// Send a request, abandoning it (and telling the peer best-effort)
    /// after `duration`.
    pub async fn send_request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        duration: Duration,
    ) -> RpcResult<Value> {
        self.check_open()?;
        let cancel = CancellationToken::new();
        let request = self.peer.send_request(method, params, Some(cancel.clone()));
        tokio::pin!(request);
        tokio::select! {
            outcome = &mut request => outcome,
            _ = tokio::time::sleep(duration) => {
                cancel.cancel();
                match request.await {
                    Err(RpcError::Cancelled) => Err(RpcError::Timeout),
                    other => other,
                }
            }
        }
    }

    pub async fn send_notification(&self, method: &str, params: Option<Value>) -> RpcResult<()> {
        self.check_open()?;
        self.peer.send_notification(method, params).await
    }

    /// Resolves once the initialise handshake has completed.
    pub async fn ready(&self) -> RpcResult<()> {
        let mut ready = self.ready.subscribe();
        tokio::select! {
            _ = self.disconnected.cancelled() => Err(RpcError::ConnectionClosed),
            outcome = ready.wait_for(|is_ready| *is_ready) => {
                outcome.map(|_| ()).map_err(|_| RpcError::ConnectionClosed)
            }
        }
    }

    /// Resolves once the connection is torn down, by `disconnect` or by a
    /// transport failure.
    pub async fn closed(&self) {
        self.disconnected.cancelled().await
    }

    pub(crate) fn mark_ready(&self) {
        self.ready.send_replace(true);
    }

    pub(crate) fn apply_peer_capabilities(&self, capabilities: &Value) {
        self.registry.apply_capabilities(capabilities);
    }

    pub(crate) async fn handshake_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> RpcResult<Value> {
        self.check_open()?;
        self.peer.request_inner(method, params, None, false).await
    }

    /// Tear the connection down. With `flush` the outgoing queue gets up
    /// to `flush_timeout` to drain first. Idempotent: later calls are
    /// no-ops; `closed()` reports full teardown.
    pub async fn disconnect(&self, flush: bool) -> RpcResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                ConnectionState::Open => *state = ConnectionState::Draining,
                ConnectionState::New => {
                    *state = ConnectionState::Closed;
                    self.disconnected.cancel();
                    return Ok(());
                }
                ConnectionState::Draining | ConnectionState::Closed => return Ok(()),
            }
        }

        log::debug!("disconnecting (flush={})", flush);

        // No new inbound work while draining.
        self.inbound_cancel.cancel();

        if flush {
            let (ack_tx, ack_rx) = oneshot::channel();
            if self.outgoing_tx.send(Outgoing::Flush(ack_tx)).await.is_ok()
                && tokio::time::timeout(self.options.flush_timeout, ack_rx)
                    .await
                    .is_err()
            {
                log::warn!("outgoing queue did not drain within the flush timeout");
            }
        }

        self.root_cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        self.correlation.fail_all();

        // The scheduler join blocks for up to the grace period.
        let scheduler = self.scheduler.clone();
        let _ = tokio::task::spawn_blocking(move || scheduler.shutdown()).await;

        *self.state.lock().unwrap() = ConnectionState::Closed;
        self.disconnected.cancel();
        log::debug!("connection closed");
        Ok(())
    }

    fn check_open(&self) -> RpcResult<()> {
        match self.state() {
            ConnectionState::Open => Ok(()),
            _ => Err(RpcError::NotConnected),
        }
    }
}

/// Send-only view of a connection, handed to handlers. Implements the
/// outbound half of the registration API without exposing lifecycle
/// control.
pub(crate) struct PeerHandle {
    dialect: Dialect,
    outgoing: mpsc::Sender<Outgoing>,
    correlation: Arc<CorrelationTable>,
    registry: Arc<HandlerRegistry>,
    ready: Arc<watch::Sender<bool>>,
    root_cancel: CancellationToken,
}

impl PeerHandle {
    async fn await_ready(&self) -> RpcResult<()> {
        let mut ready = self.ready.subscribe();
        tokio::select! {
            _ = self.root_cancel.cancelled() => Err(RpcError::ConnectionClosed),
            outcome = ready.wait_for(|is_ready| *is_ready) => {
                outcome.map(|_| ()).map_err(|_| RpcError::ConnectionClosed)
            }
        }
    }

    /// Shared request path. `gated` requests queue behind the initialise
    /// handshake; the handshake itself runs ungated.
    pub(crate) async fn request_inner(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: Option<CancellationToken>,
        gated: bool,
    ) -> RpcResult<Value> {
        if gated && method != INITIALIZE_METHOD {
            self.await_ready().await?;
        }

        let (id, response) = self.correlation.register();
        log::debug!("sending request {} (id={})", method, id);

        let envelope = Envelope::Request(Request {
            id: id.clone(),
            method: method.to_string(),
            params,
        });
        if self.outgoing.send(Outgoing::Message(envelope)).await.is_err() {
            self.correlation.abandon(&id);
            return Err(RpcError::ConnectionClosed);
        }

        match cancel {
            None => response.await.map_err(|_| RpcError::ConnectionClosed)?,
            Some(token) => {
                tokio::select! {
                    outcome = response => outcome.map_err(|_| RpcError::ConnectionClosed)?,
                    _ = token.cancelled() => {
                        self.correlation.abandon(&id);
                        // Best-effort cancel to the peer, if the queue is
                        // still open.
                        let _ = self
                            .outgoing
                            .try_send(Outgoing::Message(self.dialect.cancel_envelope(&id)));
                        log::debug!("abandoned request {} (id={})", method, id);
                        Err(RpcError::Cancelled)
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Peer for PeerHandle {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: Option<CancellationToken>,
    ) -> RpcResult<Value> {
        self.request_inner(method, params, cancel, true).await
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> RpcResult<()> {
        log::debug!("sending notification {}", method);
        let envelope = Envelope::Notification(crate::message::Notification {
            method: method.to_string(),
            params,
        });
        self.outgoing
            .send(Outgoing::Message(envelope))
            .await
            .map_err(|_| RpcError::ConnectionClosed)
    }

    fn registry(&self) -> Arc<HandlerRegistry> {
        self.registry.clone()
    }
}

/// Drains the outgoing queue to the write half. Strict FIFO; one frame is
/// fully written and flushed before the next is taken.
async fn send_loop<W: AsyncWrite + Unpin>(
    writer: W,
    mut outgoing: mpsc::Receiver<Outgoing>,
    dialect: Dialect,
    ids: Arc<IdAllocator>,
    cancel: CancellationToken,
    correlation: Arc<CorrelationTable>,
    disconnected: CancellationToken,
) {
    log::debug!("send loop started");
    let mut writer = FrameWriter::new(writer);
    let mut failed = false;

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = outgoing.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let value = match item {
            Outgoing::Flush(ack) => {
                let _ = ack.send(());
                continue;
            }
            Outgoing::Message(envelope) => {
                log::trace!("writing {}", envelope.describe());
                match dialect {
                    Dialect::Lsp => lsp::encode(&envelope),
                    Dialect::Dap => dap::encode(&envelope, &ids),
                }
            }
            Outgoing::Raw(value) => value,
        };

        let payload = match serde_json::to_vec(&value) {
            Ok(payload) => payload,
            Err(err) => {
                log::error!("failed to serialise outgoing message: {}", err);
                continue;
            }
        };

        if let Err(err) = writer.write_frame(&payload).await {
            log::error!("write failed, stopping send loop: {}", err);
            failed = true;
            break;
        }
    }

    if failed {
        correlation.fail_all();
        disconnected.cancel();
    }
    log::debug!("send loop stopped");
}

/// Reads frames, parses and classifies them, settles responses directly
/// and queues the rest for dispatch.
#[allow(clippy::too_many_arguments)]
async fn receive_loop<R: AsyncRead + Unpin>(
    reader: R,
    receiver: Receiver,
    incoming: mpsc::UnboundedSender<Inbound>,
    outgoing: mpsc::Sender<Outgoing>,
    dialect: Dialect,
    correlation: Arc<CorrelationTable>,
    cancel: CancellationToken,
    disconnected: CancellationToken,
) {
    log::debug!("receive loop started");
    let mut reader = FrameReader::new(reader);
    let mut transport_down = false;

    loop {
        let payload = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = reader.read_frame() => match frame {
                Ok(payload) => payload,
                Err(RpcError::StreamClosed) => {
                    log::debug!("peer closed the stream");
                    transport_down = true;
                    break;
                }
                Err(err) if err.is_transport() => {
                    log::error!("read failed, stopping receive loop: {}", err);
                    transport_down = true;
                    break;
                }
                Err(err) => {
                    // Framing error: drop the frame, keep the loop.
                    log::error!("{}", err);
                    continue;
                }
            },
        };

        let value: Value = match serde_json::from_slice(&payload) {
            Ok(value) => value,
            Err(err) => {
                log::error!("payload is not JSON: {}", err);
                if dialect == Dialect::Lsp {
                    let raw = lsp::null_id_error(error_codes::PARSE_ERROR, "Parse error");
                    let _ = outgoing.send(Outgoing::Raw(raw)).await;
                }
                continue;
            }
        };

        for item in receiver.classify(value) {
            match item {
                // Responses settle their pending slot right here; they
                // never queue behind handler work.
                Inbound::Response(response) => {
                    if !correlation.settle(response) {
                        log::warn!("dropping response for unknown request id");
                    }
                }
                other => {
                    if incoming.send(other).is_err() {
                        log::debug!("dispatch queue closed");
                        return;
                    }
                }
            }
        }
    }

    if transport_down {
        correlation.fail_all();
        disconnected.cancel();
    }
    log::debug!("receive loop stopped");
}

/// Hands classified inbound items to the router.
async fn dispatch_loop(
    mut incoming: mpsc::UnboundedReceiver<Inbound>,
    router: Router,
    cancel: CancellationToken,
) {
    log::debug!("dispatch loop started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            item = incoming.recv() => match item {
                Some(item) => router.dispatch(item).await,
                None => break,
            },
        }
    }
    log::debug!("dispatch loop stopped");
}
