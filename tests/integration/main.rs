//! Ghostline integration test harness.
//!
//! Tests here drive the real session and primitive code over loopback TCP
//! against a scripted fake peer. Nothing outside the test process is
//! touched.
//!
//!   cargo test --test integration
//!
//! The peer numbers connections in accept order and answers each framed
//! message according to a script keyed by (connection, message).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use ghostline::Target;
use ghostline_core::config::{KernelLayout, PrimitiveConfig};
use ghostline_core::wire;

mod primitive;
mod session;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Messages the peer received on one connection, envelopes stripped.
pub type Connection = Vec<Vec<u8>>;

pub struct FakePeer {
    pub port: u16,
    closed: mpsc::UnboundedReceiver<(usize, Connection)>,
}

impl FakePeer {
    /// Start a peer on an ephemeral loopback port. `script(conn, msg)`
    /// returns the raw bytes to answer with, or `None` to stay silent.
    pub async fn spawn<F>(script: F) -> Result<Self>
    where
        F: Fn(usize, usize) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind fake peer")?;
        let port = listener.local_addr()?.port();
        let script = Arc::new(script);
        let (tx, closed) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut next = 0;
            while let Ok((sock, _)) = listener.accept().await {
                let conn = next;
                next += 1;
                let script = script.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let messages = serve(sock, conn, script.as_ref()).await;
                    let _ = tx.send((conn, messages));
                });
            }
        });

        Ok(Self { port, closed })
    }

    /// Wait until `count` connections have closed and return them in
    /// accept order.
    pub async fn connections(&mut self, count: usize) -> Result<Vec<Connection>> {
        let mut seen = Vec::with_capacity(count);
        while seen.len() < count {
            let item = tokio::time::timeout(Duration::from_secs(10), self.closed.recv())
                .await
                .with_context(|| format!("peer saw {} of {count} connections", seen.len()))?
                .context("peer stopped")?;
            seen.push(item);
        }
        seen.sort_by_key(|(conn, _)| *conn);
        Ok(seen.into_iter().map(|(_, messages)| messages).collect())
    }

    /// Connections closed so far, without waiting.
    pub fn drain(&mut self) -> usize {
        let mut count = 0;
        while self.closed.try_recv().is_ok() {
            count += 1;
        }
        count
    }

    pub fn target(&self) -> Target {
        Target {
            host: "127.0.0.1".to_string(),
            port: self.port,
            timeout: Duration::from_millis(300),
            response_len: 1000,
        }
    }
}

async fn serve<F>(mut sock: TcpStream, conn: usize, script: &F) -> Connection
where
    F: Fn(usize, usize) -> Option<Vec<u8>>,
{
    let mut messages = Vec::new();
    loop {
        let mut header = [0u8; wire::ENVELOPE_HEADER_LEN];
        if sock.read_exact(&mut header).await.is_err() {
            break;
        }
        let len = u32::from_be_bytes([0, header[1], header[2], header[3]]) as usize;
        let mut body = vec![0u8; len];
        if sock.read_exact(&mut body).await.is_err() {
            break;
        }

        let reply = script(conn, messages.len());
        messages.push(body);
        if let Some(reply) = reply {
            if sock.write_all(&reply).await.is_err() {
                break;
            }
        }
    }
    messages
}

/// A normal negotiate answer, envelope included.
pub fn echo() -> Vec<u8> {
    wire::envelope(&wire::negotiate_request()).to_vec()
}

/// A probe answer that is not a protocol echo.
pub fn leak(first_qword: u64) -> Vec<u8> {
    let mut out = first_qword.to_le_bytes().to_vec();
    out.extend((0u8..56).map(|b| b.wrapping_mul(7)));
    out
}

pub fn settings() -> PrimitiveConfig {
    PrimitiveConfig::default()
}

pub fn layout() -> KernelLayout {
    KernelLayout::default()
}
