//! Multi-client TCP server with observer-based event dispatch.
//!
//! wirebus accepts inbound TCP connections on a single listener, tracks each
//! connection's lifecycle, and distributes every received chunk to registered
//! observers under a publish/subscribe discipline, reclaiming dead
//! connections in the background. It is a connection and event-distribution
//! substrate with no framing and no command interpretation: each successful
//! read (up to [`MAX_READ_BYTES`]) is one data event.
//!
//! # Components
//!
//! - [`Server`]: listener lifecycle, pull-style accept, live-connection
//!   collection, dispatch, reaper
//! - [`Connection`]: one accepted socket, its receive task, send/close
//! - [`Subscription`] / [`SubscriptionRegistry`]: observer registrations and
//!   the exact-or-wildcard dispatch rules
//! - [`wait`]: bounded wait giving the accept path its timeout semantics
//!
//! # Delivery guarantees
//!
//! Within one connection, data and the eventual disconnect notification
//! arrive in byte-stream order on that connection's own receive task. Across
//! connections there is no ordering. Matching subscriptions are notified in
//! insertion order; data events go to exact and wildcard filters, disconnect
//! notifications to exact filters only.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod connection;
mod error;
mod registry;
mod server;
pub mod wait;

pub use connection::{
    Connection, ConnectionEvent, EventCallback, MAX_READ_BYTES, REPLY_NOK, REPLY_OK,
};
pub use error::ServerError;
pub use registry::{
    ConnectionDataFn, DisconnectFn, IpDataFn, Subscription, SubscriptionRegistry,
};
pub use server::{DEFAULT_PORT, REAP_INTERVAL, Server, ServerConfig};
