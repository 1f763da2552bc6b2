//! Server error types.
//!
//! One flat taxonomy for everything the server surfaces: listener setup
//! (socket/bind/listen), the accept path (accept/wait/timeout), per-connection
//! I/O, and targeted-send lookups. Variants carry the underlying OS error text
//! untruncated so operators see the real cause.

use std::{net::IpAddr, time::Duration};

use thiserror::Error;

/// Errors that can occur in the server.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// Creating or configuring the listening socket failed.
    ///
    /// Startup-time failure (socket(2), SO_REUSEADDR, non-blocking mode).
    /// Fatal to this server instance.
    #[error("socket setup failed: {0}")]
    Socket(String),

    /// Binding the listening socket failed.
    ///
    /// Usually the port is already in use or requires privileges. Fatal to
    /// this server instance.
    #[error("bind failed: {0}")]
    Bind(String),

    /// Putting the socket into listening mode failed.
    ///
    /// Fatal to this server instance.
    #[error("listen failed: {0}")]
    Listen(String),

    /// Accepting a client failed.
    ///
    /// Per-iteration failure on the unbounded accept path. Recoverable: the
    /// accept loop should log and keep accepting.
    #[error("accept failed: {0}")]
    Accept(String),

    /// The bounded wait for a pending client failed.
    ///
    /// Per-iteration failure on the deadline-bounded accept path.
    /// Recoverable, same policy as [`ServerError::Accept`].
    #[error("wait for client failed: {0}")]
    Wait(String),

    /// No client arrived within the accept deadline.
    ///
    /// Not a fault: the caller asked for a bounded wait and the bound
    /// elapsed. Poll again.
    #[error("timed out after {limit:?} waiting for a client")]
    Timeout {
        /// The deadline that elapsed.
        limit: Duration,
    },

    /// A connection-level read, write, or close failed.
    ///
    /// Returned to the caller of the failing send/close; never tears down
    /// the server or other connections.
    #[error("i/o error: {0}")]
    Io(String),

    /// No live connection matches the requested peer address.
    #[error("no connected client with address {0}")]
    NotFound(IpAddr),
}

impl ServerError {
    /// Returns true if this is the accept deadline elapsing rather than a
    /// fault.
    ///
    /// Accept loops polling with a bound use this to keep a quiet idle path:
    /// timeouts are expected, everything else deserves a log line.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
