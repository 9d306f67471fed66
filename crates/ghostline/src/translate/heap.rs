//! HAL heap scan for the interrupt controller.
//!
//! The controller structure is recognised by a run of consecutive qwords
//! that all carry the kernel-half tag. The run ends a fixed distance past
//! the structure base, and the handler pointer sits at a fixed offset from
//! that base.

use super::{
    scan_width, Phase, TranslationContext, TranslationError, Translator, PAGE_OFFSET_MASK,
};
use crate::primitive::{qword_at, PhysicalMemory};

impl<M: PhysicalMemory> Translator<M> {
    /// Walk `heap_window` bytes of the HAL heap looking for the tagged run
    /// and record the controller address and its handler pointer.
    pub async fn scan_heap(&mut self, ctx: &mut TranslationContext) -> Result<(), TranslationError> {
        let base = ctx.hal_heap()?;
        let window = self.discovery.heap_window;
        let end = base.saturating_add(window);
        let tag = self.discovery.kernel_tag;
        let tag_mask = self.discovery.kernel_tag_mask;
        let run_len = self.discovery.tagged_run_len.max(1);
        let run_end_to_base = self.layout.run_end_to_base;
        let handler_from_run_end = self
            .layout
            .interrupt_target_offset
            .wrapping_sub(run_end_to_base);

        // (virtual page, physical page) of the last translation.
        let mut mapped: Option<(u64, u64)> = None;
        let mut run = 0usize;
        let mut index = base;

        while index < end {
            let va_page = index & !PAGE_OFFSET_MASK;
            let phys_page = match mapped {
                Some((page, phys)) if page == va_page => phys,
                _ => {
                    let phys = self.translate(ctx, va_page).await? & !PAGE_OFFSET_MASK;
                    tracing::debug!(
                        va = format_args!("{va_page:#x}"),
                        phys = format_args!("{phys:#x}"),
                        "heap page"
                    );
                    mapped = Some((va_page, phys));
                    phys
                }
            };
            let phys = phys_page + (index & PAGE_OFFSET_MASK);

            let buf = self.read_required(Phase::HeapScan, phys).await?;
            let width = scan_width(buf.len());
            if width == 0 {
                return Err(TranslationError::ShortRead {
                    phase: Phase::HeapScan,
                    addr: phys,
                    len: buf.len(),
                    need: 16,
                });
            }

            let mut i = 0;
            while i < width {
                let entry = qword_at(&buf, i).unwrap_or(0);
                i += 8;
                if entry & tag_mask != tag {
                    run = 0;
                    continue;
                }
                run += 1;
                if run < run_len {
                    continue;
                }

                let controller = (index + i as u64).wrapping_sub(run_end_to_base);
                let slot = (i as u64).wrapping_add(handler_from_run_end);
                let in_buffer = usize::try_from(slot).ok().and_then(|s| qword_at(&buf, s));
                let handler = match in_buffer {
                    Some(handler) => handler,
                    None => {
                        self.read_qword(Phase::HeapScan, phys.wrapping_add(slot))
                            .await?
                    }
                };

                tracing::info!(
                    controller = format_args!("{controller:#x}"),
                    handler = format_args!("{handler:#x}"),
                    "found interrupt controller"
                );
                ctx.set_interrupt_controller(controller, handler);
                return Ok(());
            }

            index += width as u64;
        }

        Err(TranslationError::HeapStructureNotFound { base, window })
    }
}
