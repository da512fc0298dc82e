//! # tether - bidirectional message engine for editor tooling
//!
//! A JSON-RPC 2.0 client/server runtime for the two framed protocols
//! editors speak: the Language Server Protocol and the Debug Adapter
//! Protocol. Both run over `Content-Length`-delimited frames on a byte
//! stream pair (stdio, pipes, or an in-memory duplex for tests).
//!
//! ## Main components
//!
//! - [`framing`]: the Content-Length codec
//! - [`receiver`]: classification of parsed JSON into typed messages
//! - [`correlation`]: the in-flight request table
//! - [`scheduler`]: Serial/Parallel ordering of handler work
//! - [`registry`] / [`router`]: typed handler dispatch
//! - [`connection`]: the driver owning the send/receive/dispatch loops
//!
//! ## Example
//!
//! ```rust,no_run
//! use tether::{Connection, ConnectionOptions, HandlerOptions};
//!
//! # async fn run() -> tether::RpcResult<()> {
//! let conn = Connection::new(ConnectionOptions::lsp());
//! conn.registry()
//!     .register("ping", HandlerOptions::parallel(), |(): (), _ctx| async move {
//!         Ok("pong")
//!     })?
//!     .detach();
//!
//! let (reader, writer) = tether::transport::stdio();
//! conn.connect(reader, writer)?;
//! conn.ready().await?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod correlation;
pub mod error;
pub mod framing;
pub mod handler;
pub mod handshake;
pub mod message;
pub mod receiver;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod transport;

// Re-export the surface most callers need.
pub use connection::{Connection, ConnectionOptions, ConnectionState};
pub use error::{HandlerError, RpcError, RpcResult};
pub use handler::{Peer, RequestContext};
pub use message::{Dialect, Envelope, Notification, Request, RequestId, Response, ResponseError};
pub use receiver::{Inbound, Receiver};
pub use registry::{HandlerOptions, HandlerRegistry, Registration};
pub use scheduler::ProcessType;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default tuning constants
pub mod defaults {
    use std::time::Duration;

    /// Bound on draining the outgoing queue in `disconnect(flush)`
    pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

    /// Bound on waiting for outstanding handler tasks at shutdown
    pub const SCHEDULER_GRACE: Duration = Duration::from_secs(5);

    /// Capacity of the bounded outgoing queue
    pub const OUTGOING_QUEUE_CAPACITY: usize = 64;
}
