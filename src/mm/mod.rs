use crate::boot::MemoryDescription;

/// Physical memory handling.
pub mod phys;

/// Kernel heap.
pub mod kalloc;

/// Brings up the memory subsystem: the physical allocator first, then the kernel heap on top of
/// it.
///
/// # Panics
///
/// Panics if called more than once, or if any allocator cannot be set up.
///
/// # Safety
///
/// The memory described by `desc` must be valid and unused for the lifetime of the kernel.
pub unsafe fn init(desc: &MemoryDescription<'_>) {
    // SAFETY: guaranteed by the caller
    unsafe { phys::init(desc) };
    kalloc::init();
}
