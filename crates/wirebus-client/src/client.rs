//! TCP client connection and the request/ack helpers.

use std::{net::SocketAddr, time::Duration};

use bytes::Bytes;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

/// Largest number of bytes one reply read returns; mirrors the server's
/// per-read delivery cap.
pub const MAX_REPLY_BYTES: usize = 4096;

/// Prefix of a positive server acknowledgement (`cmd:=OK`, newline follows).
pub const OK_PREFIX: &[u8] = b"cmd:=OK";

/// Client-side errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Establishing the connection failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The connect deadline elapsed.
    #[error("timed out after {limit:?} connecting to {addr}")]
    Timeout {
        /// Server address the connect targeted.
        addr: SocketAddr,
        /// The deadline that elapsed.
        limit: Duration,
    },

    /// A read or write on the established connection failed.
    #[error("i/o error: {0}")]
    Io(String),

    /// The server closed the connection (EOF on read).
    #[error("server closed the connection")]
    Closed,

    /// The server's reply was not a positive acknowledgement; carries the
    /// reply text.
    #[error("negative or unexpected reply: {0}")]
    Nak(String),
}

/// One TCP connection to a wirebus server.
#[derive(Debug)]
pub struct Client {
    stream: TcpStream,
}

impl Client {
    /// Connect to `addr`, bounded by `limit` (zero = wait indefinitely).
    pub async fn connect(addr: SocketAddr, limit: Duration) -> Result<Self, ClientError> {
        let stream = if limit.is_zero() {
            TcpStream::connect(addr).await.map_err(|e| ClientError::Connect(e.to_string()))?
        } else {
            match timeout(limit, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(ClientError::Connect(e.to_string())),
                Err(_) => return Err(ClientError::Timeout { addr, limit }),
            }
        };
        Ok(Self { stream })
    }

    /// Local address of this connection.
    pub fn local_addr(&self) -> Result<SocketAddr, ClientError> {
        self.stream.local_addr().map_err(|e| ClientError::Io(e.to_string()))
    }

    /// Write all of `bytes`, unframed.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        self.stream.write_all(bytes).await.map_err(|e| ClientError::Io(e.to_string()))
    }

    /// Read one chunk of up to [`MAX_REPLY_BYTES`] bytes.
    ///
    /// EOF is [`ClientError::Closed`]. Chunk boundaries are read boundaries,
    /// same as on the server side.
    pub async fn recv_chunk(&mut self) -> Result<Bytes, ClientError> {
        let mut buf = vec![0u8; MAX_REPLY_BYTES];
        let n = self.stream.read(&mut buf).await.map_err(|e| ClientError::Io(e.to_string()))?;
        if n == 0 {
            return Err(ClientError::Closed);
        }
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    /// Send `bytes` and read one reply chunk.
    pub async fn request(&mut self, bytes: &[u8]) -> Result<Bytes, ClientError> {
        self.send(bytes).await?;
        self.recv_chunk().await
    }

    /// Send `bytes` and require a positive ack.
    ///
    /// Anything not starting with [`OK_PREFIX`] (including the fixed NOK
    /// token) becomes [`ClientError::Nak`] carrying the reply text.
    pub async fn request_ok(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        let reply = self.request(bytes).await?;
        if reply.starts_with(OK_PREFIX) {
            Ok(())
        } else {
            Err(ClientError::Nak(String::from_utf8_lossy(&reply).into_owned()))
        }
    }

    /// Shut the connection down.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.stream.shutdown().await.map_err(|e| ClientError::Io(e.to_string()))
    }
}
