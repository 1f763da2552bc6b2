//! The server: listener lifecycle, accept path, live connections, event
//! dispatch, and the reaper.
//!
//! # Lifecycle
//!
//! ```text
//! Created --start--> Listening --close--> Closed
//! ```
//!
//! `start` binds and listens; the caller then drives [`Server::accept_client`]
//! in a loop, polling [`Server::should_terminate`] between iterations. `close`
//! is one-way: it wakes any in-flight accept, stops the reaper, tears down
//! every live connection, and releases the listener.
//!
//! # Locking
//!
//! Two independent locks: the connection collection (async mutex, sends
//! iterate and await under it) and the subscription registry (sync mutex,
//! dispatch never awaits while holding it). No code path spans both.
//! Observer callbacks must not reach for the connections lock; that contract
//! lives on [`Subscription`].

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        Arc, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::broadcast,
    task::JoinHandle,
    time::MissedTickBehavior,
};

use crate::{
    connection::{Connection, ConnectionEvent, EventCallback},
    error::ServerError,
    registry::{Subscription, SubscriptionRegistry},
    wait::{self, WaitStatus},
};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 51821;

/// Interval between reaper scans for disconnected clients.
pub const REAP_INTERVAL: Duration = Duration::from_secs(2);

/// Listener settings consumed by [`Server::start`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port, bound on `INADDR_ANY` with `SO_REUSEADDR`. Port 0 binds an
    /// ephemeral port; see [`Server::local_addr`].
    pub port: u16,
    /// Accept backlog handed to listen(2).
    pub backlog: u32,
    /// Spawn the background reaper that prunes disconnected connections.
    pub auto_reap: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: DEFAULT_PORT, backlog: 64, auto_reap: true }
    }
}

struct Shared {
    /// `Some` while listening; taken by `close`.
    listener: tokio::sync::Mutex<Option<TcpListener>>,
    /// Live connections in insertion order.
    connections: tokio::sync::Mutex<Vec<Connection>>,
    /// Observer registrations. Sync mutex: dispatch holds it across
    /// callbacks and never awaits under it.
    subscriptions: std::sync::Mutex<SubscriptionRegistry>,
    /// Plain caller-visible flag polled by accept loops.
    terminate: AtomicBool,
    /// Latched by `close` before the shutdown broadcast goes out.
    closing: AtomicBool,
    /// Wakes in-flight accepts and the reaper during `close`.
    shutdown: broadcast::Sender<()>,
    reaper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    /// Dispatch delegate bound to every accepted connection; runs on that
    /// connection's receive task.
    fn dispatch(&self, conn: &Connection, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Data(bytes) => {
                let registry =
                    self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
                registry.dispatch_data(conn, &bytes);
            },
            ConnectionEvent::Disconnected(reason) => {
                tracing::debug!("Client {} disconnected: {}", conn.peer_addr(), reason);
                let registry =
                    self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
                registry.dispatch_disconnect(conn.peer_ip(), &reason);
            },
        }
    }
}

/// Multi-client TCP server with observer-based event dispatch.
///
/// Cheap-clone handle: clones address the same server, so the composition
/// root can hand one clone to a signal task and keep another for the accept
/// loop.
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    /// Create a server in the `Created` state. Nothing is bound until
    /// [`Server::start`].
    #[must_use]
    pub fn new() -> Self {
        let (shutdown, _) = broadcast::channel(4);
        Self {
            shared: Arc::new(Shared {
                listener: tokio::sync::Mutex::new(None),
                connections: tokio::sync::Mutex::new(Vec::new()),
                subscriptions: std::sync::Mutex::new(SubscriptionRegistry::new()),
                terminate: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                shutdown,
                reaper: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Bind and listen; spawns the reaper if `auto_reap` is set.
    ///
    /// Failures (`Socket`/`Bind`/`Listen`) leave nothing bound; the caller
    /// may retry with another config. Starting an already-listening or
    /// closed server is an error.
    pub async fn start(&self, config: &ServerConfig) -> Result<(), ServerError> {
        if self.shared.closing.load(Ordering::Acquire) {
            return Err(ServerError::Listen("server is closed".to_string()));
        }

        let mut slot = self.shared.listener.lock().await;
        if slot.is_some() {
            return Err(ServerError::Listen("server is already listening".to_string()));
        }

        let listener = bind_listener(config)?;
        let local = listener.local_addr().map_err(|e| ServerError::Socket(e.to_string()))?;
        *slot = Some(listener);
        drop(slot);

        if config.auto_reap {
            let shared = Arc::clone(&self.shared);
            let shutdown = self.shared.shutdown.subscribe();
            let task = tokio::spawn(run_reaper(shared, shutdown));
            *self.shared.reaper.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        }

        tracing::info!("Listening on {}", local);
        Ok(())
    }

    /// Address the listener is bound to. Useful when starting on port 0.
    pub async fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        let slot = self.shared.listener.lock().await;
        let listener = slot
            .as_ref()
            .ok_or_else(|| ServerError::Listen("server is not listening".to_string()))?;
        listener.local_addr().map_err(|e| ServerError::Socket(e.to_string()))
    }

    /// Accept one client, optionally bounded by `limit` (zero = wait
    /// indefinitely).
    ///
    /// On success the connection's receive task is running with the server's
    /// dispatch delegate bound, the connection is in the live collection, and
    /// the peer's IP is returned. Bounded waits fail with `Timeout`/`Wait`,
    /// unbounded ones with `Accept`; all are per-iteration errors the caller
    /// should log and retry (see [`ServerError::is_timeout`] for quiet
    /// polling).
    ///
    /// Accept is a pull operation: drive it in a loop gated on
    /// [`Server::should_terminate`]. The listener lock serializes concurrent
    /// callers (one accept loop at a time).
    pub async fn accept_client(&self, limit: Duration) -> Result<IpAddr, ServerError> {
        let mut shutdown = self.shared.shutdown.subscribe();
        let slot = self.shared.listener.lock().await;
        let listener = slot
            .as_ref()
            .ok_or_else(|| ServerError::Accept("server is not listening".to_string()))?;
        if self.shared.closing.load(Ordering::Acquire) {
            return Err(ServerError::Accept("server is shutting down".to_string()));
        }

        let (stream, peer) = tokio::select! {
            _ = shutdown.recv() => {
                return Err(ServerError::Accept("server is shutting down".to_string()));
            },
            accepted = accept_with_limit(listener, limit) => accepted?,
        };
        drop(slot);

        // close() may have won the race after the stream was accepted; drop
        // it rather than registering a connection nothing will ever reap.
        if self.shared.closing.load(Ordering::Acquire) {
            return Err(ServerError::Accept("server is shutting down".to_string()));
        }

        let conn = Connection::new(stream, peer);
        let shared = Arc::clone(&self.shared);
        let delegate: EventCallback = Arc::new(move |c, event| shared.dispatch(c, event));
        conn.start_receiving(delegate)?;

        let mut connections = self.shared.connections.lock().await;
        connections.push(conn);
        tracing::debug!("Accepted client {} ({} live)", peer, connections.len());
        Ok(peer.ip())
    }

    /// Register an observer. Append-only: subscriptions live for the
    /// server's lifetime and are dispatched in insertion order.
    pub fn subscribe(&self, subscription: Subscription) {
        self.shared
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribe(subscription);
    }

    /// Send `bytes` to every live connection, in insertion order.
    ///
    /// Fail-fast: returns the first connection's error immediately, without
    /// attempting the remaining connections. Connections before the failing
    /// one have already received the bytes.
    pub async fn send_to_all_clients(&self, bytes: &[u8]) -> Result<(), ServerError> {
        let connections = self.shared.connections.lock().await;
        for conn in connections.iter() {
            conn.send(bytes).await?;
        }
        Ok(())
    }

    /// Send `bytes` to the first live connection whose peer IP equals `ip`.
    ///
    /// Fails with [`ServerError::NotFound`] when no connection matches.
    pub async fn send_to_client(&self, ip: IpAddr, bytes: &[u8]) -> Result<(), ServerError> {
        let connections = self.shared.connections.lock().await;
        let conn = connections
            .iter()
            .find(|c| c.peer_ip() == ip)
            .ok_or(ServerError::NotFound(ip))?;
        conn.send(bytes).await
    }

    /// Number of connections currently in the live collection (reaped ones
    /// are gone, disconnected-but-unreaped ones still count).
    pub async fn connection_count(&self) -> usize {
        self.shared.connections.lock().await.len()
    }

    /// Snapshot of live peer addresses, in insertion order.
    pub async fn client_addrs(&self) -> Vec<SocketAddr> {
        self.shared.connections.lock().await.iter().map(Connection::peer_addr).collect()
    }

    /// Whether termination has been requested. Accept loops poll this
    /// between iterations.
    #[must_use]
    pub fn should_terminate(&self) -> bool {
        self.shared.terminate.load(Ordering::Acquire)
    }

    /// Request (or rescind) termination. A plain flag write; it unblocks
    /// nothing by itself, so pair it with [`Server::close`].
    pub fn set_terminate(&self, flag: bool) {
        self.shared.terminate.store(flag, Ordering::Release);
    }

    /// Tear the server down: wake any in-flight accept, stop and join the
    /// reaper, close and join every live connection, release the listener.
    ///
    /// Callable from a signal task and safe to call twice. The shutdown
    /// broadcast goes out before any lock is taken here, so a concurrent
    /// [`Server::accept_client`] always releases the listener lock instead
    /// of deadlocking against this method.
    pub async fn close(&self) {
        self.shared.closing.store(true, Ordering::Release);
        let _ = self.shared.shutdown.send(());

        let reaper = self.shared.reaper.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = reaper {
            let _ = task.await;
        }

        let mut connections = self.shared.connections.lock().await;
        for conn in connections.iter() {
            if let Err(e) = conn.close().await {
                tracing::debug!("Closing {} failed: {}", conn.peer_addr(), e);
            }
        }
        for conn in connections.drain(..) {
            conn.join().await;
        }
        drop(connections);

        let listener = self.shared.listener.lock().await.take();
        drop(listener);
        tracing::info!("Server closed");
    }
}

/// Build the listening socket step by step so each failure keeps its own
/// error class: socket(2) and options are `Socket`, bind(2) is `Bind`,
/// listen(2) is `Listen`.
fn bind_listener(config: &ServerConfig) -> Result<TcpListener, ServerError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| ServerError::Socket(e.to_string()))?;
    socket.set_reuse_address(true).map_err(|e| ServerError::Socket(e.to_string()))?;

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    socket.bind(&addr.into()).map_err(|e| ServerError::Bind(e.to_string()))?;

    let backlog = i32::try_from(config.backlog).unwrap_or(i32::MAX);
    socket.listen(backlog).map_err(|e| ServerError::Listen(e.to_string()))?;

    socket.set_nonblocking(true).map_err(|e| ServerError::Socket(e.to_string()))?;
    TcpListener::from_std(socket.into()).map_err(|e| ServerError::Socket(e.to_string()))
}

async fn accept_with_limit(
    listener: &TcpListener,
    limit: Duration,
) -> Result<(TcpStream, SocketAddr), ServerError> {
    if limit.is_zero() {
        listener.accept().await.map_err(|e| ServerError::Accept(e.to_string()))
    } else {
        match wait::wait_for_client(listener, limit).await? {
            WaitStatus::Ready(stream, addr) => Ok((stream, addr)),
            WaitStatus::TimedOut => Err(ServerError::Timeout { limit }),
        }
    }
}

async fn run_reaper(shared: Arc<Shared>, mut shutdown: broadcast::Receiver<()>) {
    let mut tick = tokio::time::interval(REAP_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = tick.tick() => reap_disconnected(&shared).await,
        }
    }
    tracing::debug!("Reaper stopped");
}

/// One reaper pass: rescan under the connections lock until no disconnected
/// entry remains, closing and joining each one removed. This is the only
/// place connections are reclaimed outside of `close`.
async fn reap_disconnected(shared: &Shared) {
    let mut connections = shared.connections.lock().await;
    while let Some(pos) = connections.iter().position(|c| !c.is_connected()) {
        let conn = connections.remove(pos);
        if let Err(e) = conn.close().await {
            tracing::debug!("Closing reaped {} failed: {}", conn.peer_addr(), e);
        }
        conn.join().await;
        tracing::debug!("Reaped disconnected client {}", conn.peer_addr());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_daemon_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.backlog, 64);
        assert!(config.auto_reap);
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let server = Server::new();
        let config = ServerConfig { port: 0, ..ServerConfig::default() };
        server.start(&config).await.unwrap();

        let second = server.start(&config).await;
        assert!(matches!(second, Err(ServerError::Listen(_))));

        server.close().await;
    }

    #[tokio::test]
    async fn accept_before_start_fails() {
        let server = Server::new();
        let result = server.accept_client(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(ServerError::Accept(_))));
    }

    #[tokio::test]
    async fn start_after_close_fails() {
        let server = Server::new();
        let config = ServerConfig { port: 0, ..ServerConfig::default() };
        server.start(&config).await.unwrap();
        server.close().await;

        let restart = server.start(&config).await;
        assert!(matches!(restart, Err(ServerError::Listen(_))));
    }

    #[tokio::test]
    async fn close_twice_is_safe() {
        let server = Server::new();
        let config = ServerConfig { port: 0, ..ServerConfig::default() };
        server.start(&config).await.unwrap();

        server.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn terminate_flag_round_trips() {
        let server = Server::new();
        assert!(!server.should_terminate());
        server.set_terminate(true);
        assert!(server.should_terminate());
        server.set_terminate(false);
        assert!(!server.should_terminate());
    }
}
