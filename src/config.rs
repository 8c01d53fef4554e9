//! Compile-time configuration of the memory subsystem.

use kmm::allocator::{kalloc::KallocConfig, sboo::SbooConfig, slob::SLOB_ENTRY_MAGIC};

pub use kmm::PAGE_SIZE;

/// Number of pool size classes of the kernel heap.
pub use kmm::allocator::kalloc::SBOO_CLASSES as KALLOC_SBOO_CLASSES;

/// Page size of the kernel heap slob allocator.
pub const KALLOC_SLOB_PAGE_SIZE: usize = PAGE_SIZE;

/// Ownership magic of the kernel heap slob entries.
pub const KALLOC_SLOB_MAGIC: u32 = SLOB_ENTRY_MAGIC;

/// Number of object slots a pool header may take inside its page.
pub const KALLOC_SBOO_INTERNAL_SLOTS: usize = 1;

/// Returns the configuration of the kernel heap.
pub fn kalloc_config() -> KallocConfig {
    KallocConfig {
        sboo: SbooConfig {
            internal_slots: KALLOC_SBOO_INTERNAL_SLOTS,
            ..SbooConfig::default()
        },
    }
}
