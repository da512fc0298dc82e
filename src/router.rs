//! Routes classified inbound messages to handlers and completion slots.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::connection::Outgoing;
use crate::correlation::CorrelationTable;
use crate::error::HandlerError;
use crate::handler::{Peer, RequestContext};
use crate::message::lsp::error_codes;
use crate::message::{dap, lsp, Dialect, Envelope, Notification, Request, RequestId, Response, ResponseError};
use crate::receiver::Inbound;
use crate::registry::HandlerRegistry;
use crate::scheduler::Scheduler;

/// Method name both dialects use to announce the end of the initialise
/// handshake: a notification for LSP, an event for DAP.
const INITIALIZED: &str = "initialized";

/// In-flight inbound requests, keyed by their wire id. A cancel sentinel
/// trips the matching token; completion removes the entry.
pub(crate) type Executions = Arc<Mutex<HashMap<RequestId, CancellationToken>>>;

pub(crate) struct Router {
    pub dialect: Dialect,
    /// Compatibility flag: failed DAP handlers answer with error id 500
    /// instead of the JSON-RPC internal-error code.
    pub dap_http_error_code: bool,
    pub registry: Arc<HandlerRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub correlation: Arc<CorrelationTable>,
    pub outgoing: mpsc::Sender<Outgoing>,
    pub executions: Executions,
    pub root_cancel: CancellationToken,
    pub peer: Arc<dyn Peer>,
    pub ready: Arc<watch::Sender<bool>>,
}

impl Router {
    /// Route one classified inbound item.
    pub async fn dispatch(&self, item: Inbound) {
        match item {
            Inbound::Request(request) => self.dispatch_request(request).await,
            Inbound::Notification(notification) => {
                self.dispatch_notification(notification).await
            }
            Inbound::Response(response) => {
                if !self.correlation.settle(response) {
                    log::warn!("dropping response for unknown request id");
                }
            }
            Inbound::Invalid { id, reason } => self.reject(id, &reason).await,
        }
    }

    async fn dispatch_request(&self, request: Request) {
        log::debug!("handling request {} (id={})", request.method, request.id);

        // DAP cancellation arrives as a real request; answer it after
        // tripping the target.
        if self.dialect == Dialect::Dap && request.method == dap::CANCEL_COMMAND {
            self.trip_cancellation(self.dialect.cancel_target(request.params.as_ref()));
            let response =
                Response::success(request.id, Value::Null).with_command(request.method);
            self.send(Envelope::Response(response)).await;
            return;
        }

        let Some(record) = self.registry.lookup(&request.method) else {
            let error = ResponseError::new(
                error_codes::METHOD_NOT_FOUND,
                format!("Method '{}' not found", request.method),
            );
            let response = Response::error(request.id, error).with_command(request.method);
            self.send(Envelope::Response(response)).await;
            return;
        };

        let cancel = self.root_cancel.child_token();
        let ctx = RequestContext {
            cancel: cancel.clone(),
            peer: self.peer.clone(),
        };

        let future = match (record.invoker)(request.params.clone(), ctx) {
            Ok(future) => future,
            Err(decode_err) => {
                let error = ResponseError::new(
                    error_codes::INVALID_PARAMS,
                    format!("Invalid params: {}", decode_err),
                );
                let response = Response::error(request.id, error).with_command(request.method);
                self.send(Envelope::Response(response)).await;
                return;
            }
        };

        {
            let mut executions = self.executions.lock().unwrap();
            if executions.insert(request.id.clone(), cancel.clone()).is_some() {
                log::warn!("inbound request id {} already in flight", request.id);
            }
        }

        let id = request.id;
        let method = request.method;
        let outgoing = self.outgoing.clone();
        let executions = self.executions.clone();
        let dap_http_error_code = self.dap_http_error_code;

        let job = Box::pin(async move {
            let outcome = future.await;
            executions.lock().unwrap().remove(&id);

            let response = match outcome {
                Ok(result) => Response::success(id, result),
                Err(err) => Response::error(
                    id,
                    handler_error(err, cancel.is_cancelled(), dap_http_error_code),
                ),
            }
            .with_command(method);

            if outgoing
                .send(Outgoing::Message(Envelope::Response(response)))
                .await
                .is_err()
            {
                log::debug!("outgoing queue closed before response could be sent");
            }
        });

        let process_type = self.registry.process_type(&record);
        if !self.scheduler.enqueue(process_type, job) {
            log::warn!("scheduler stopped, dropping inbound request");
        }
    }

    async fn dispatch_notification(&self, notification: Notification) {
        log::debug!("handling notification {}", notification.method);

        if notification.method == self.dialect.cancel_method() {
            self.trip_cancellation(self.dialect.cancel_target(notification.params.as_ref()));
            return;
        }

        // Both dialects signal handshake completion with "initialized";
        // flip the ready flag and still deliver to a handler if one exists.
        if notification.method == INITIALIZED {
            self.ready.send_replace(true);
        }

        let Some(record) = self.registry.lookup(&notification.method) else {
            log::debug!("no handler for notification {}, dropping", notification.method);
            return;
        };

        let ctx = RequestContext {
            cancel: self.root_cancel.child_token(),
            peer: self.peer.clone(),
        };

        let future = match (record.invoker)(notification.params.clone(), ctx) {
            Ok(future) => future,
            Err(decode_err) => {
                log::error!(
                    "notification {} payload did not decode: {}",
                    notification.method,
                    decode_err
                );
                return;
            }
        };

        let method = notification.method;
        let job = Box::pin(async move {
            if let Err(err) = future.await {
                log::error!("notification handler {} failed: {}", method, err);
            }
        });

        let process_type = self.registry.process_type(&record);
        if !self.scheduler.enqueue(process_type, job) {
            log::warn!("scheduler stopped, dropping inbound notification");
        }
    }

    fn trip_cancellation(&self, target: Option<RequestId>) {
        let Some(target) = target else {
            log::warn!("cancel sentinel without a request id");
            return;
        };
        match self.executions.lock().unwrap().get(&target) {
            Some(token) => {
                log::debug!("cancelling inbound request {}", target);
                token.cancel();
            }
            None => log::debug!("cancel for unknown or completed request {}", target),
        }
    }

    /// Answer an invalid message. LSP replies with `InvalidRequest`, using
    /// a null id when none was recoverable; DAP has no way to address a
    /// response without a request seq, so those are logged and dropped.
    async fn reject(&self, id: Option<RequestId>, reason: &str) {
        log::warn!("invalid inbound message: {}", reason);
        match (self.dialect, id) {
            (_, Some(id)) => {
                let error = ResponseError::new(error_codes::INVALID_REQUEST, reason);
                self.send(Envelope::Response(Response::error(id, error))).await;
            }
            (Dialect::Lsp, None) => {
                let raw = lsp::null_id_error(error_codes::INVALID_REQUEST, reason);
                if self.outgoing.send(Outgoing::Raw(raw)).await.is_err() {
                    log::debug!("outgoing queue closed before error could be sent");
                }
            }
            (Dialect::Dap, None) => {}
        }
    }

    async fn send(&self, envelope: Envelope) {
        if self.outgoing.send(Outgoing::Message(envelope)).await.is_err() {
            log::debug!("outgoing queue closed, dropping {}", "message");
        }
    }
}

/// Map a handler failure onto the wire error shape. A cancelled handler
/// answers RequestCancelled; otherwise InternalError (or the DAP
/// compatibility code) with the error string carried as data.
fn handler_error(err: HandlerError, cancelled: bool, dap_http_error_code: bool) -> ResponseError {
    let code = err.code.unwrap_or(if cancelled {
        error_codes::REQUEST_CANCELLED
    } else if dap_http_error_code {
        dap::HTTP_ERROR_CODE
    } else {
        error_codes::INTERNAL_ERROR
    });
    let data = err
        .data
        .clone()
        .unwrap_or_else(|| Value::String(err.message.clone()));
    ResponseError::new(code, err.message).with_data(data)
}
