//! Address translation engine.
//!
//! Walks the peer's page tables and locates kernel structures using
//! nothing but physical reads. Every step depends on the one before it, so
//! there is no concurrency and no partial result: a failed step ends the
//! run with a named error.

mod context;
mod discovery;
mod heap;
mod walk;

pub use context::TranslationContext;
pub use walk::PageIndices;

use std::fmt;

use bytes::Bytes;

use ghostline_core::config::{DiscoveryConfig, KernelLayout};

use crate::primitive::{qword_at, PhysicalMemory, PrimitiveError};

/// Physical frame bits of a page-table entry.
pub const FRAME_MASK: u64 = 0x000F_FFFF_FFFF_F000;

pub const PAGE_SIZE: u64 = 0x1000;
const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

pub struct Translator<M> {
    memory: M,
    discovery: DiscoveryConfig,
    layout: KernelLayout,
}

impl<M: PhysicalMemory> Translator<M> {
    pub fn new(memory: M, discovery: DiscoveryConfig, layout: KernelLayout) -> Self {
        Self {
            memory,
            discovery,
            layout,
        }
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Read that must produce data. No-data is fatal here.
    async fn read_required(&mut self, phase: Phase, addr: u64) -> Result<Bytes, TranslationError> {
        self.memory
            .read_physical(addr)
            .await
            .map_err(|source| TranslationError::Primitive {
                phase,
                addr,
                source,
            })?
            .ok_or(TranslationError::ReadFailed { phase, addr })
    }

    async fn read_qword(&mut self, phase: Phase, addr: u64) -> Result<u64, TranslationError> {
        let buf = self.read_required(phase, addr).await?;
        qword_at(&buf, 0).ok_or(TranslationError::ShortRead {
            phase,
            addr,
            len: buf.len(),
            need: 8,
        })
    }
}

/// Bytes of a response worth scanning as qwords: the response rounded to
/// whole qwords, minus the last one.
pub(crate) fn scan_width(len: usize) -> usize {
    8 * ((len + 4) / 8).saturating_sub(1)
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Which discovery step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    LowStub,
    SelfRef,
    PageWalk,
    HeapScan,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::LowStub => "low stub search",
            Phase::SelfRef => "self-reference search",
            Phase::PageWalk => "page walk",
            Phase::HeapScan => "heap scan",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TranslationError {
    #[error("low stub not found below {limit:#x}")]
    LowStubNotFound { limit: u64 },

    #[error("no self-referencing entry in top-level table at {pml4:#x}")]
    SelfRefNotFound { pml4: u64 },

    #[error("no tagged run in {window:#x} bytes of heap at {base:#x}")]
    HeapStructureNotFound { base: u64, window: u64 },

    #[error("{phase}: read at {addr:#x} returned no data")]
    ReadFailed { phase: Phase, addr: u64 },

    #[error("{phase}: read at {addr:#x} returned {len} bytes, need {need}")]
    ShortRead {
        phase: Phase,
        addr: u64,
        len: usize,
        need: usize,
    },

    #[error("{0} has not been discovered yet")]
    Unresolved(&'static str),

    #[error("{phase}: read at {addr:#x} failed: {source}")]
    Primitive {
        phase: Phase,
        addr: u64,
        #[source]
        source: PrimitiveError,
    },
}

// ── Test memory ───────────────────────────────────────────────────────────────
