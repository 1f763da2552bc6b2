//! Bounded wait for a pending client on the listening socket.
//!
//! Gives the accept path its deadline semantics: wait until a client is
//! pending, the bound elapses, or the wait itself fails. Under the async
//! runtime the readiness check and the accept are one cancel-safe operation,
//! so the ready outcome carries the accepted stream and a lapsed bound never
//! drops a pending connection.

use std::{net::SocketAddr, time::Duration};

use tokio::net::{TcpListener, TcpStream};

use crate::error::ServerError;

/// Outcome of a bounded wait on the listening socket.
#[derive(Debug)]
pub enum WaitStatus {
    /// A client was pending and has been accepted.
    Ready(TcpStream, SocketAddr),
    /// No client arrived within the bound.
    TimedOut,
}

/// Wait up to `limit` for a client, accepting it if one arrives.
///
/// Returns [`WaitStatus::TimedOut`] when the bound elapses and
/// [`ServerError::Wait`] when the underlying accept fails during the wait.
/// `limit` must be nonzero; unbounded accepts bypass this primitive entirely.
pub async fn wait_for_client(
    listener: &TcpListener,
    limit: Duration,
) -> Result<WaitStatus, ServerError> {
    match tokio::time::timeout(limit, listener.accept()).await {
        Ok(Ok((stream, addr))) => Ok(WaitStatus::Ready(stream, addr)),
        Ok(Err(e)) => Err(ServerError::Wait(e.to_string())),
        Err(_) => Ok(WaitStatus::TimedOut),
    }
}
