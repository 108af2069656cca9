//! # vcache-server
//!
//! In-memory file server behind a Unix stream socket.
//!
//! ## Architecture
//!
//! ```text
//! acceptor (main thread) --NewConnection--> dispatcher --WorkItem--> WorkQueue --> workers
//!                                               ^                                    |
//!                                               +------------ Resume / Close --------+
//! ```
//!
//! - The acceptor owns the listening socket and process signals.
//! - The dispatcher is the only thread that polls client sockets. It reads
//!   one frame from a ready connection and parks that connection until its
//!   reply has been written, which keeps each client's requests in order.
//! - Workers run requests against the [`store::FileStore`] and the
//!   [`session::SessionTable`] and write replies straight to the socket.

pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod queue;
pub mod server;
pub mod session;
pub mod signals;
pub mod store;
pub mod worker;

mod sync;

use std::fmt;

pub use error::{Result, ServerError, SessionError, StoreError};
pub use handler::RequestHandler;
pub use server::{Server, ServerHandle, ServerReport};
pub use store::{FileStore, StoreStats};

/// Identifies one client connection for the lifetime of the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// How the server winds down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Workers finish the request in hand; queued requests are dropped
    Stop,
    /// Workers empty the queue first; no new connections are accepted
    Drain,
}
