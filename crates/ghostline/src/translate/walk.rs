//! Four-level page walk, virtual to physical.

use super::{Phase, TranslationContext, TranslationError, Translator, FRAME_MASK, PAGE_OFFSET_MASK};
use crate::primitive::PhysicalMemory;

const INDEX_MASK: u64 = 0x1FF;

/// PS bit: the entry maps a large page directly.
const LARGE_PAGE: u64 = 1 << 7;

/// Offset bits inside a 2 MiB page.
const LARGE_PAGE_OFFSET_MASK: u64 = 0x1F_FFFF;

/// Table indices of a virtual address, top level first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageIndices {
    pub pml4: u64,
    pub pdpt: u64,
    pub pd: u64,
    pub pt: u64,
}

impl PageIndices {
    pub fn of(va: u64) -> Self {
        Self {
            pml4: (va >> 39) & INDEX_MASK,
            pdpt: (va >> 30) & INDEX_MASK,
            pd: (va >> 21) & INDEX_MASK,
            pt: (va >> 12) & INDEX_MASK,
        }
    }
}

impl<M: PhysicalMemory> Translator<M> {
    /// Translate `va` by reading one entry per level. Fails on the first
    /// read that comes back empty.
    pub async fn translate(
        &mut self,
        ctx: &TranslationContext,
        va: u64,
    ) -> Result<u64, TranslationError> {
        let idx = PageIndices::of(va);
        let pml4 = ctx.pml4()?;

        let pml4e = self.read_qword(Phase::PageWalk, pml4 + idx.pml4 * 8).await?;
        let pdpt = pml4e & FRAME_MASK;

        let pdpte = self.read_qword(Phase::PageWalk, pdpt + idx.pdpt * 8).await?;
        let pd = pdpte & FRAME_MASK;

        let pde = self.read_qword(Phase::PageWalk, pd + idx.pd * 8).await?;
        if pde & LARGE_PAGE != 0 {
            let phys = (pde & FRAME_MASK) + (va & LARGE_PAGE_OFFSET_MASK);
            tracing::trace!(
                va = format_args!("{va:#x}"),
                phys = format_args!("{phys:#x}"),
                "translated (large page)"
            );
            return Ok(phys);
        }
        let pt = pde & FRAME_MASK;

        let pte = self.read_qword(Phase::PageWalk, pt + idx.pt * 8).await?;
        let phys = (pte & FRAME_MASK) + (va & PAGE_OFFSET_MASK);
        tracing::trace!(
            va = format_args!("{va:#x}"),
            phys = format_args!("{phys:#x}"),
            "translated"
        );
        Ok(phys)
    }
}
