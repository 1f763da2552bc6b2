//! Observer subscriptions and their dispatch rules.
//!
//! A [`Subscription`] is an optional IP filter plus up to three optional
//! callback slots; an absent slot is a no-op. The [`SubscriptionRegistry`] is
//! append-only: entries are immutable once registered and live for the
//! server's lifetime, so the owner's lock only ever serializes dispatch reads
//! against rare registrations.
//!
//! Matching is asymmetric by contract: data events go to exact and wildcard
//! matches, disconnect notifications go to exact matches only.

use std::{fmt, net::IpAddr};

use bytes::Bytes;

use crate::connection::Connection;

/// IP-scoped data callback: `(peer ip, bytes) -> handled`.
pub type IpDataFn = Box<dyn Fn(IpAddr, &Bytes) -> bool + Send + Sync>;

/// Connection-scoped data callback: `(connection, bytes) -> handled`.
///
/// The handle may be used to reply (`send_ok`/`send_nok`); it must not be
/// used to reach back into the server.
pub type ConnectionDataFn = Box<dyn Fn(&Connection, &Bytes) -> bool + Send + Sync>;

/// Disconnect callback: `(peer ip, reason)`.
pub type DisconnectFn = Box<dyn Fn(IpAddr, &str) + Send + Sync>;

/// One observer registration.
///
/// Callbacks run synchronously on the dispatching connection's receive task
/// while the subscriptions lock is held. Keep them short and non-blocking.
/// Never call back into the server from inside a callback (no send-to-all,
/// no accept, no close, no re-subscribe); replying on the delivered
/// connection handle is fine.
pub struct Subscription {
    filter: Option<IpAddr>,
    on_data: Option<IpDataFn>,
    on_connection_data: Option<ConnectionDataFn>,
    on_disconnect: Option<DisconnectFn>,
}

impl Subscription {
    /// Subscription matching data from every connection (wildcard).
    #[must_use]
    pub fn any() -> Self {
        Self { filter: None, on_data: None, on_connection_data: None, on_disconnect: None }
    }

    /// Subscription matching only the given peer IP.
    #[must_use]
    pub fn for_peer(ip: IpAddr) -> Self {
        Self { filter: Some(ip), on_data: None, on_connection_data: None, on_disconnect: None }
    }

    /// Set the IP-scoped data slot.
    #[must_use]
    pub fn on_data(mut self, f: impl Fn(IpAddr, &Bytes) -> bool + Send + Sync + 'static) -> Self {
        self.on_data = Some(Box::new(f));
        self
    }

    /// Set the connection-scoped data slot.
    #[must_use]
    pub fn on_connection_data(
        mut self,
        f: impl Fn(&Connection, &Bytes) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.on_connection_data = Some(Box::new(f));
        self
    }

    /// Set the disconnect slot.
    ///
    /// Only fires for subscriptions whose filter exactly equals the
    /// disconnecting peer's IP; wildcard subscriptions never receive
    /// disconnect notifications.
    #[must_use]
    pub fn on_disconnect(mut self, f: impl Fn(IpAddr, &str) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Box::new(f));
        self
    }

    /// The IP filter; `None` is the wildcard.
    #[must_use]
    pub fn filter(&self) -> Option<IpAddr> {
        self.filter
    }

    /// Whether a data event from `ip` is delivered to this subscription.
    #[must_use]
    pub fn matches_data(&self, ip: IpAddr) -> bool {
        match self.filter {
            None => true,
            Some(wanted) => wanted == ip,
        }
    }

    /// Whether a disconnect from `ip` is delivered to this subscription.
    #[must_use]
    pub fn matches_disconnect(&self, ip: IpAddr) -> bool {
        self.filter == Some(ip)
    }

    /// Invoke both configured data slots with the same bytes. Return values
    /// are advisory and ignored here.
    fn deliver_data(&self, conn: &Connection, bytes: &Bytes) {
        if let Some(handler) = &self.on_data {
            let _ = handler(conn.peer_ip(), bytes);
        }
        if let Some(handler) = &self.on_connection_data {
            let _ = handler(conn, bytes);
        }
    }

    fn deliver_disconnect(&self, ip: IpAddr, reason: &str) {
        if let Some(handler) = &self.on_disconnect {
            handler(ip, reason);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("filter", &self.filter)
            .field("on_data", &self.on_data.is_some())
            .field("on_connection_data", &self.on_connection_data.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .finish()
    }
}

/// Append-only, insertion-ordered collection of subscriptions.
///
/// The registry itself is not synchronized; the server owns it behind the
/// subscriptions lock and dispatches while holding that lock.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Vec<Subscription>,
}

impl SubscriptionRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a subscription. There is no removal: subscriptions live for
    /// the server's lifetime.
    pub fn subscribe(&mut self, subscription: Subscription) {
        self.entries.push(subscription);
    }

    /// Number of registered subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no subscriptions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deliver one data chunk to every matching subscription, in insertion
    /// order, via both of its configured data slots.
    pub fn dispatch_data(&self, conn: &Connection, bytes: &Bytes) {
        let ip = conn.peer_ip();
        for subscription in self.entries.iter().filter(|s| s.matches_data(ip)) {
            subscription.deliver_data(conn, bytes);
        }
    }

    /// Deliver a disconnect notification to every subscription whose filter
    /// exactly equals `ip`, in insertion order.
    pub fn dispatch_disconnect(&self, ip: IpAddr, reason: &str) {
        for subscription in self.entries.iter().filter(|s| s.matches_disconnect(ip)) {
            subscription.deliver_disconnect(ip, reason);
        }
    }
}
