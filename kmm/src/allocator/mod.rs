//! Collection of memory allocators.
//!
//! Every allocator in this module implements [`MemAllocator`]. Allocators that need backing
//! memory (pages for their own bookkeeping or for the objects they hand out) are themselves built
//! on top of another `&dyn MemAllocator`, so that any allocator can back any other.
//!
//! Each allocator keeps its mutable state behind a single [`spin::Mutex`], taken once at the
//! contract boundary. The algorithms themselves run on the unlocked inner state.

use core::{fmt, ptr::NonNull};

pub mod buddy;
pub mod kalloc;
pub mod sboo;
pub mod slob;

/// The error type returned when an allocator cannot be constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AllocatorError {
    /// The provided address is not properly aligned.
    UnalignedAddress,
    /// The provided page size is not valid.
    InvalidPageSize,
    /// The provided object size is not valid for the page size.
    InvalidObjectSize,
    /// The provided memory region cannot hold a single page.
    EmptyRegion,
    /// The backing allocator could not provide memory for the allocator metadata.
    OutOfMemory,
}

impl AllocatorError {
    /// Returns a short description of the error.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnalignedAddress => "address is not properly aligned",
            Self::InvalidPageSize => "page size is not a non-zero power of two",
            Self::InvalidObjectSize => "object size is not valid for the page size",
            Self::EmptyRegion => "memory region is smaller than a page",
            Self::OutOfMemory => "out of memory for allocator metadata",
        }
    }
}

impl fmt::Display for AllocatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The contract shared by every kernel memory allocator.
///
/// Only [`allocate`](Self::allocate) and [`release`](Self::release) are mandatory. The remaining
/// operations have conservative defaults: an allocator that does not support them reports
/// failure, and callers must treat that failure as "fall back to allocate and copy" (for
/// [`resize`](Self::resize)) or "the memory stays committed" (for
/// [`reserve`](Self::reserve)/[`unreserve`](Self::unreserve)), never as a fatal condition.
pub trait MemAllocator: Send + Sync {
    /// Allocates a memory block of at least `size` bytes.
    ///
    /// Returns `None` if the request cannot be satisfied. A request of zero bytes always fails.
    /// The returned block never intersects a range marked with [`reserve`](Self::reserve).
    fn allocate(&self, size: usize) -> Option<NonNull<u8>>;

    /// Releases a memory block.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by a previous call to [`allocate`](Self::allocate) (or
    /// [`resize`](Self::resize)) on this same allocator, and must not have been released since.
    unsafe fn release(&self, ptr: NonNull<u8>);

    /// Allocates a zero-filled array of `count` elements of `size` bytes each.
    fn zeroed_allocate(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let total = count.checked_mul(size)?;
        let ptr = self.allocate(total)?;

        // SAFETY: the block was just allocated with at least `total` bytes
        unsafe { ptr.as_ptr().write_bytes(0, total) };

        Some(ptr)
    }

    /// Changes the size of a memory block, possibly moving it.
    ///
    /// Returns `None` if the operation is unsupported or failed. Resizing to zero bytes releases
    /// the block and returns `None`.
    ///
    /// # Safety
    ///
    /// Same requirements as [`release`](Self::release).
    unsafe fn resize(&self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        let _ = (ptr, new_size);
        None
    }

    /// Marks a memory range as permanently unavailable for allocation.
    ///
    /// Returns `false` if the operation is unsupported or failed.
    fn reserve(&self, ptr: *mut u8, size: usize) -> bool {
        let _ = (ptr, size);
        false
    }

    /// Makes a memory range marked with [`reserve`](Self::reserve) available again.
    ///
    /// Returns `false` if the operation is unsupported or failed.
    fn unreserve(&self, ptr: *mut u8, size: usize) -> bool {
        let _ = (ptr, size);
        false
    }
}

impl fmt::Debug for dyn MemAllocator + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn MemAllocator")
    }
}
