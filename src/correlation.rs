//! Correlation table for in-flight outgoing requests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::RpcError;
use crate::message::{RequestId, Response};

/// Monotonic id source, starting at 1. Shared between the correlation
/// table (request ids) and the DAP encoder (response/event `seq`).
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicI64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicI64::new(1),
        }
    }

    pub fn allocate(&self) -> i64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Completion slot for one pending request. Settled exactly once: the
/// sender is removed from the table before use on every path.
type Slot = oneshot::Sender<Result<Value, RpcError>>;

/// Maps outgoing request id to its completion slot.
pub struct CorrelationTable {
    ids: Arc<IdAllocator>,
    pending: Mutex<HashMap<i64, Slot>>,
}

impl CorrelationTable {
    pub fn new(ids: Arc<IdAllocator>) -> Self {
        Self {
            ids,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a fresh id and enter a pending slot for it. Collisions are
    /// impossible: ids are handed out once per connection.
    pub fn register(&self) -> (RequestId, oneshot::Receiver<Result<Value, RpcError>>) {
        let id = self.ids.allocate();
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().unwrap();
        pending.insert(id, tx);
        log::trace!(
            "registered pending request id={} ({} in flight)",
            id,
            pending.len()
        );
        (RequestId::Number(id), rx)
    }

    /// Settle the pending request matching an inbound response. Returns
    /// false when no entry matches; the caller logs and drops those.
    pub fn settle(&self, response: Response) -> bool {
        let Some(id) = response.id.as_number() else {
            return false;
        };
        let slot = self.pending.lock().unwrap().remove(&id);
        match slot {
            Some(tx) => {
                let outcome = response.result.map_err(RpcError::Peer);
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Drop the slot for a request the caller abandoned. After this, a late
    /// response for the id is unknown and gets dropped.
    pub fn abandon(&self, id: &RequestId) {
        if let Some(id) = id.as_number() {
            self.pending.lock().unwrap().remove(&id);
        }
    }

    /// Settle every remaining entry with a connection-closed error. Used on
    /// disconnect and on transport failure.
    pub fn fail_all(&self) {
        let drained: Vec<Slot> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, tx)| tx).collect()
        };
        if !drained.is_empty() {
            log::debug!("failing {} pending requests: connection closed", drained.len());
        }
        for tx in drained {
            let _ = tx.send(Err(RpcError::ConnectionClosed));
        }
    }

    pub fn in_flight(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}
