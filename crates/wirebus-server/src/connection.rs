//! One accepted TCP connection and its receive loop.
//!
//! A [`Connection`] is a cheap-clone handle: clones address the same socket,
//! and the server's collection entry is the owning reference. Each connection
//! runs at most one receive task, started by [`Connection::start_receiving`];
//! that task is the only producer of [`ConnectionEvent`]s, which keeps event
//! order identical to byte-stream order for the life of the connection.
//!
//! State is a single one-way flip: `Connected → Disconnected`, set by the
//! receive loop on EOF or read error, or by explicit [`Connection::close`].
//! It never reverts.

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    sync::{
        Arc, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Notify,
    task::JoinHandle,
};

use crate::error::ServerError;

/// Largest number of bytes a single read delivers to observers.
///
/// Delivery boundaries are read boundaries; peers sending more than this per
/// message see it arrive as multiple data events.
pub const MAX_READ_BYTES: usize = 4096;

/// Fixed positive-ack token, newline-terminated.
pub const REPLY_OK: &[u8] = b"cmd:=OK\n";

/// Fixed negative-ack token, newline-terminated.
pub const REPLY_NOK: &[u8] = b"cmd:=NOK\n";

/// Event produced by a connection's receive task.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// One successful read: up to [`MAX_READ_BYTES`] raw bytes, exact length,
    /// no framing.
    Data(Bytes),

    /// The receive loop observed EOF or a read error; carries an explanatory
    /// message. Fired at most once, after the state flip. Explicit `close`
    /// does not synthesize this event.
    Disconnected(String),
}

/// Callback invoked on the connection's own receive task for every event.
pub type EventCallback = Arc<dyn Fn(&Connection, ConnectionEvent) + Send + Sync>;

struct Inner {
    peer: SocketAddr,
    connected: AtomicBool,
    /// Taken exactly once by `start_receiving`; enforces the single receive
    /// task per connection.
    reader: std::sync::Mutex<Option<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    /// Wakes the receive task out of a pending read on explicit close. A
    /// stored permit covers the task being mid-callback when close runs.
    stop: Notify,
    receive_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Handle to one accepted TCP connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Wrap an accepted stream. The peer address is fixed here for the
    /// connection's lifetime.
    pub(crate) fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            inner: Arc::new(Inner {
                peer,
                connected: AtomicBool::new(true),
                reader: std::sync::Mutex::new(Some(reader)),
                writer: tokio::sync::Mutex::new(writer),
                stop: Notify::new(),
                receive_task: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Remote address of the peer, resolved at accept time.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Remote IP of the peer; this is what subscription filters match on.
    #[must_use]
    pub fn peer_ip(&self) -> IpAddr {
        self.inner.peer.ip()
    }

    /// Whether the connection is still in the `Connected` state.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Spawn the receive task, delivering every event to `callback`.
    ///
    /// The task loops on reads of up to [`MAX_READ_BYTES`] bytes and invokes
    /// the callback synchronously on its own task, so within one connection
    /// events arrive in byte-stream order. On EOF or read error it flips the
    /// state, fires [`ConnectionEvent::Disconnected`] once, and exits.
    ///
    /// At most one receive task ever runs per connection: a second call
    /// fails with [`ServerError::Io`]. Must be called from within the
    /// runtime.
    pub fn start_receiving(&self, callback: EventCallback) -> Result<(), ServerError> {
        let reader = self
            .inner
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| {
                ServerError::Io(format!("receive loop for {} already started", self.inner.peer))
            })?;

        let conn = self.clone();
        let task = tokio::spawn(run_receive(conn, reader, callback));
        *self.inner.receive_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        Ok(())
    }

    /// Write all of `bytes` to the peer.
    ///
    /// Awaits completion, so the caller observes write failures
    /// synchronously; suspends under backpressure. Fails with
    /// [`ServerError::Io`] if the connection is already disconnected or the
    /// write fails.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), ServerError> {
        if !self.is_connected() {
            return Err(ServerError::Io(format!(
                "connection to {} is disconnected",
                self.inner.peer
            )));
        }
        let mut writer = self.inner.writer.lock().await;
        writer
            .write_all(bytes)
            .await
            .map_err(|e| ServerError::Io(format!("send to {} failed: {e}", self.inner.peer)))
    }

    /// Reply with the fixed [`REPLY_OK`] token, fire-and-forget.
    ///
    /// Safe to call from observer callbacks: it takes no server lock and
    /// never suspends the caller. Failures are logged, not returned.
    pub fn send_ok(&self) {
        self.send_detached(REPLY_OK);
    }

    /// Reply with the fixed [`REPLY_NOK`] token, fire-and-forget.
    ///
    /// Same contract as [`Connection::send_ok`].
    pub fn send_nok(&self) {
        self.send_detached(REPLY_NOK);
    }

    fn send_detached(&self, token: &'static [u8]) {
        let conn = self.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.send(token).await {
                tracing::warn!("Ack to {} failed: {}", conn.peer_addr(), e);
            }
        });
    }

    /// Mark the connection disconnected, stop its receive task, and shut the
    /// socket down.
    ///
    /// Does not synthesize a [`ConnectionEvent::Disconnected`] event; only
    /// the receive loop's own detection dispatches one. Idempotence is not
    /// guaranteed: a second close may fail with [`ServerError::Io`] from the
    /// underlying shutdown.
    pub async fn close(&self) -> Result<(), ServerError> {
        self.inner.connected.store(false, Ordering::Release);
        self.inner.stop.notify_one();
        let mut writer = self.inner.writer.lock().await;
        writer
            .shutdown()
            .await
            .map_err(|e| ServerError::Io(format!("close of {} failed: {e}", self.inner.peer)))
    }

    /// Wait for the receive task to exit. No-op if it was never started or
    /// has already been joined.
    pub(crate) async fn join(&self) {
        let task =
            self.inner.receive_task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if e.is_panic() {
                    tracing::warn!("Receive task for {} panicked: {}", self.inner.peer, e);
                }
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.inner.peer)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

async fn run_receive(conn: Connection, mut reader: OwnedReadHalf, callback: EventCallback) {
    let mut buf = vec![0u8; MAX_READ_BYTES];
    loop {
        tokio::select! {
            _ = conn.inner.stop.notified() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    conn.inner.connected.store(false, Ordering::Release);
                    callback(
                        &conn,
                        ConnectionEvent::Disconnected("peer closed the connection".to_string()),
                    );
                    break;
                },
                Ok(n) => {
                    callback(&conn, ConnectionEvent::Data(Bytes::copy_from_slice(&buf[..n])));
                },
                Err(e) => {
                    conn.inner.connected.store(false, Ordering::Release);
                    callback(&conn, ConnectionEvent::Disconnected(format!("read failed: {e}")));
                    break;
                },
            },
        }
    }
    tracing::debug!("Receive task for {} exited", conn.inner.peer);
}
