//! State discovered during a run.
//!
//! Fields start unresolved and are filled in by the discovery steps in
//! order. Asking for one before its step has run is an error, never a
//! default.

use super::TranslationError;

/// Canonical upper half of a kernel address.
const KERNEL_HALF: u64 = 0xFFFF << 48;

/// Span covered by one top-level entry.
const TOP_LEVEL_SPAN: u64 = 1 << 39;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslationContext {
    pml4: Option<u64>,
    pml4_selfref: Option<u64>,
    hal_heap: Option<u64>,
    interrupt_controller: Option<u64>,
    interrupt_handler: Option<u64>,
}

impl TranslationContext {
    /// Physical base of the top-level page table.
    pub fn pml4(&self) -> Result<u64, TranslationError> {
        self.pml4.ok_or(TranslationError::Unresolved("pml4"))
    }

    /// Index of the self-referencing top-level entry.
    pub fn pml4_selfref(&self) -> Result<u64, TranslationError> {
        self.pml4_selfref
            .ok_or(TranslationError::Unresolved("pml4_selfref"))
    }

    /// Virtual base of the HAL heap.
    pub fn hal_heap(&self) -> Result<u64, TranslationError> {
        self.hal_heap.ok_or(TranslationError::Unresolved("hal_heap"))
    }

    /// Virtual address of the interrupt controller structure.
    pub fn interrupt_controller(&self) -> Result<u64, TranslationError> {
        self.interrupt_controller
            .ok_or(TranslationError::Unresolved("interrupt_controller"))
    }

    /// Function pointer held in the interrupt controller.
    pub fn interrupt_handler(&self) -> Result<u64, TranslationError> {
        self.interrupt_handler
            .ok_or(TranslationError::Unresolved("interrupt_handler"))
    }

    pub fn set_pml4(&mut self, pml4: u64) {
        self.pml4 = Some(pml4);
    }

    pub fn set_pml4_selfref(&mut self, index: u64) {
        self.pml4_selfref = Some(index);
    }

    pub fn set_hal_heap(&mut self, base: u64) {
        self.hal_heap = Some(base);
    }

    pub fn set_interrupt_controller(&mut self, controller: u64, handler: u64) {
        self.interrupt_controller = Some(controller);
        self.interrupt_handler = Some(handler);
    }

    /// Virtual address of the page-table entry that maps `va`, through the
    /// self-referencing top-level slot.
    pub fn pte_address(&self, va: u64) -> Result<u64, TranslationError> {
        let index = self.pml4_selfref()?;
        let lower = KERNEL_HALF | (index << 39);
        let upper = (KERNEL_HALF | ((index << 39) + TOP_LEVEL_SPAN - 1)) & !7;
        Ok(((va >> 9) | lower) & upper)
    }
}
