//! Short-lived TCP session with the peer.
//!
//! One session is one socket: connect, negotiate, at most one more
//! exchange, close. Nothing is reused between primitive calls; the peer is
//! assumed to survive only one corruption sequence per connection.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use ghostline_core::config::{PrimitiveConfig, TargetConfig};
use ghostline_core::wire;

/// Where and how to reach the peer.
#[derive(Debug, Clone)]
pub struct Target {
    pub host: String,
    pub port: u16,
    /// Applied to connect and to every receive.
    pub timeout: Duration,
    /// Largest single response read.
    pub response_len: usize,
}

impl Target {
    pub fn from_config(target: &TargetConfig, primitive: &PrimitiveConfig) -> Self {
        Self {
            host: target.host.clone(),
            port: target.port,
            timeout: Duration::from_secs(target.timeout_secs),
            response_len: primitive.response_len,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

pub struct RemoteSession {
    stream: TcpStream,
    io_timeout: Duration,
    response_len: usize,
}

impl RemoteSession {
    pub async fn connect(target: &Target) -> Result<Self, SessionError> {
        let stream = timeout(
            target.timeout,
            TcpStream::connect((target.host.as_str(), target.port)),
        )
        .await
        .map_err(|_| SessionError::Timeout("connect"))?
        .map_err(|e| SessionError::Connect(target.to_string(), e))?;

        stream.set_nodelay(true).map_err(SessionError::Io)?;
        tracing::trace!(%target, "connected");

        Ok(Self {
            stream,
            io_timeout: target.timeout,
            response_len: target.response_len,
        })
    }

    /// Send the fixed negotiate request and return the peer's answer.
    pub async fn negotiate(&mut self) -> Result<Bytes, SessionError> {
        self.send(&wire::negotiate_request()).await?;
        self.recv().await
    }

    /// Frame `message` in a transport envelope and send it.
    pub async fn send(&mut self, message: &[u8]) -> Result<(), SessionError> {
        let framed = wire::envelope(message);
        self.stream
            .write_all(&framed)
            .await
            .map_err(SessionError::Io)?;
        tracing::trace!(len = framed.len(), "sent");
        Ok(())
    }

    /// One read of at most `response_len` bytes, envelope included. An
    /// empty result means the peer closed the connection.
    pub async fn recv(&mut self) -> Result<Bytes, SessionError> {
        let mut buf = vec![0u8; self.response_len];
        let n = timeout(self.io_timeout, self.stream.read(&mut buf))
            .await
            .map_err(|_| SessionError::Timeout("recv"))?
            .map_err(SessionError::Io)?;
        buf.truncate(n);
        tracing::trace!(len = n, "received");
        Ok(Bytes::from(buf))
    }

    /// Best-effort graceful close. Dropping the session also closes the
    /// socket.
    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            tracing::trace!(error = %e, "shutdown failed");
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to connect to {0}: {1}")]
    Connect(String, std::io::Error),

    #[error("session I/O failed: {0}")]
    Io(std::io::Error),

    #[error("timed out during {0}")]
    Timeout(&'static str),
}

impl SessionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::Timeout(_))
    }
}
