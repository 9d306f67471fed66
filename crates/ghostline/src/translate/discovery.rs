//! Low stub and self-reference discovery.
//!
//! The low stub is the real-mode trampoline kept in the first megabyte of
//! physical memory. It begins with a fixed jump and stores both the kernel
//! page-table base and its own kernel VA at fixed offsets, which is enough
//! to bootstrap everything else.

use super::{
    scan_width, Phase, TranslationContext, TranslationError, Translator, FRAME_MASK,
    PAGE_OFFSET_MASK, PAGE_SIZE,
};
use crate::primitive::{qword_at, PhysicalMemory};

/// First qword of the low stub: `jmp rel32` with the displacement byte
/// masked out.
pub const LOWSTUB_SIGNATURE: u64 = 0x0000_0001_0006_00E9;
const LOWSTUB_SIGNATURE_MASK: u64 = 0xFFFF_FFFF_FFFF_00FF;

/// The low stub's self VA rounded down to this gives the HAL heap base.
const HEAP_BASE_MASK: u64 = 0xFFFF_FFFF_F000_0000;

impl<M: PhysicalMemory> Translator<M> {
    /// Scan low physical memory for the low stub and record the page-table
    /// base and the heap base it carries.
    pub async fn find_low_stub(
        &mut self,
        ctx: &mut TranslationContext,
    ) -> Result<(), TranslationError> {
        let start = self.discovery.lowstub_start;
        let limit = self.discovery.lowstub_limit;
        let stride = self.discovery.lowstub_stride.max(8);
        let pml4_offset = self.layout.lowstub_pml4_offset;
        let self_va_offset = self.layout.lowstub_self_va_offset;

        let mut addr = start;
        while addr < limit {
            let buf = self.read_required(Phase::LowStub, addr).await?;
            let is_stub = qword_at(&buf, 0)
                .is_some_and(|head| head & LOWSTUB_SIGNATURE_MASK == LOWSTUB_SIGNATURE);
            if !is_stub {
                addr += stride;
                continue;
            }

            let short = |need| TranslationError::ShortRead {
                phase: Phase::LowStub,
                addr,
                len: buf.len(),
                need,
            };
            let pml4 = qword_at(&buf, pml4_offset).ok_or_else(|| short(pml4_offset + 8))?;
            let self_va = qword_at(&buf, self_va_offset).ok_or_else(|| short(self_va_offset + 8))?;

            let pml4 = pml4 & FRAME_MASK;
            let heap = self_va & HEAP_BASE_MASK;
            tracing::info!(
                stub = format_args!("{addr:#x}"),
                pml4 = format_args!("{pml4:#x}"),
                hal_heap = format_args!("{heap:#x}"),
                "found low stub"
            );

            ctx.set_pml4(pml4);
            ctx.set_hal_heap(heap);
            return Ok(());
        }

        Err(TranslationError::LowStubNotFound { limit })
    }

    /// Find the top-level entry that maps the table onto itself and record
    /// its index.
    pub async fn find_pml4_selfref(
        &mut self,
        ctx: &mut TranslationContext,
    ) -> Result<u64, TranslationError> {
        let pml4 = ctx.pml4()?;
        let entry = self
            .search_selfref(pml4)
            .await?
            .ok_or(TranslationError::SelfRefNotFound { pml4 })?;

        let index = (entry & PAGE_OFFSET_MASK) >> 3;
        tracing::info!(index = format_args!("{index:#x}"), "found pml4 self-reference");
        ctx.set_pml4_selfref(index);
        Ok(index)
    }

    /// Physical address of the first entry in the table page at `pml4`
    /// whose frame is `pml4` itself.
    pub async fn search_selfref(&mut self, pml4: u64) -> Result<Option<u64>, TranslationError> {
        let end = pml4 + PAGE_SIZE;
        let mut addr = pml4;

        while addr < end {
            let buf = self.read_required(Phase::SelfRef, addr).await?;
            let width = scan_width(buf.len());
            if width == 0 {
                return Err(TranslationError::ShortRead {
                    phase: Phase::SelfRef,
                    addr,
                    len: buf.len(),
                    need: 16,
                });
            }

            for off in (0..width).step_by(8) {
                let entry_addr = addr + off as u64;
                if entry_addr >= end {
                    break;
                }
                let entry = qword_at(&buf, off).unwrap_or(0);
                if entry & FRAME_MASK == pml4 {
                    return Ok(Some(entry_addr));
                }
            }
            addr += width as u64;
        }

        Ok(None)
    }
}
