//! Host-side fixtures shared by the kernel tests.

use std::{alloc::Layout, boxed::Box, ops::Range};

use kmm::{allocator::buddy::MAX_ORDER, PAGE_SIZE};
use lazy_static::lazy_static;

use crate::boot::{MemoryDescription, ReservedRange};

const MIB: usize = 1024 * 1024;

/// Size of the simulated machine memory.
const MEMORY_SIZE: usize = 32 * MIB;

/// Allocates `size` bytes of host memory aligned to the largest buddy block, never released.
pub fn leak_memory(size: usize) -> usize {
    let layout = Layout::from_size_align(size, PAGE_SIZE << MAX_ORDER).unwrap();
    let base = unsafe { std::alloc::alloc_zeroed(layout) };
    assert!(!base.is_null(), "host allocation failed");
    base as usize
}

/// A simulated machine, booted once with the global allocators initialized over it.
pub struct BootFixture {
    pub memory: Range<usize>,
    pub reserved: &'static ReservedRange<'static>,
    pub kernel_image: Range<usize>,
    pub load_offset: usize,
}

impl BootFixture {
    /// Returns the memory description the fixture was booted with.
    pub fn description(&self) -> MemoryDescription<'static> {
        MemoryDescription {
            mem_lower: self.memory.start + PAGE_SIZE,
            mem_upper: self.memory.end,
            reserved: Some(self.reserved),
            kernel_image: self.kernel_image.clone(),
            load_offset: self.load_offset,
        }
    }
}

lazy_static! {
    static ref BOOT: BootFixture = {
        let base = leak_memory(MEMORY_SIZE);

        // A hole in the middle of memory, and the low megabyte owned by the firmware
        let hole: &'static ReservedRange<'static> =
            Box::leak(Box::new(ReservedRange::new(base + 20 * MIB, base + 21 * MIB, None)));
        let firmware: &'static ReservedRange<'static> =
            Box::leak(Box::new(ReservedRange::new(base, base + MIB, Some(hole))));

        let fixture = BootFixture {
            memory: base..base + MEMORY_SIZE,
            reserved: firmware,
            kernel_image: base + MIB..base + 2 * MIB + 0x800,
            load_offset: base + MIB,
        };

        unsafe { crate::mm::init(&fixture.description()) };
        fixture
    };
}

/// Returns the booted machine, booting it on first use.
pub fn boot() -> &'static BootFixture {
    &BOOT
}
