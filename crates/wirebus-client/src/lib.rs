//! Thin TCP client for wirebus servers.
//!
//! Speaks the server's raw-chunk discipline: writes go out unframed, replies
//! are read one chunk at a time (up to [`MAX_REPLY_BYTES`]), and the fixed
//! `cmd:=OK` token marks a positive acknowledgement. Used by peers of the
//! server and by its integration tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod client;

pub use client::{Client, ClientError, MAX_REPLY_BYTES, OK_PREFIX};
