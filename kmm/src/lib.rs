//! Kernel memory management.
//!
//! This crate contains the allocator stack of the kernel: a buddy allocator for physical pages,
//! a free-list allocator for variable-size objects ([`SlobAllocator`]), a bitmap-based pool
//! allocator for fixed-size objects ([`SbooAllocator`]) and a general-purpose allocator that
//! routes requests between them ([`Kalloc`]).
//!
//! All allocators implement the [`MemAllocator`] contract, and higher layers only ever depend on
//! the contract, never on a concrete allocator.
//!
//! [`SlobAllocator`]: allocator::slob::SlobAllocator
//! [`SbooAllocator`]: allocator::sboo::SbooAllocator
//! [`Kalloc`]: allocator::kalloc::Kalloc
//! [`MemAllocator`]: allocator::MemAllocator

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![deny(missing_debug_implementations)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod allocator;
pub mod bitmap;

#[cfg(test)]
mod testing;

/// The page granularity of the allocator stack.
pub const PAGE_SIZE: usize = 4096;

/// A trait for numeric types that can be aligned to a boundary.
pub trait Align<U> {
    /// Aligns address upwards to the specified bound.
    ///
    /// Returns the first address greater or equal than `addr` with alignment `align`.
    fn align_up(&self, align: U) -> Self;

    /// Aligns address downwards to the specified bound.
    ///
    /// Returns the first address lower or equal than `addr` with alignment `align`.
    fn align_down(&self, align: U) -> Self;

    /// Checks whether the address has the specified alignment.
    fn is_aligned(&self, align: U) -> bool;
}

impl Align<usize> for usize {
    fn align_up(&self, align: usize) -> Self {
        debug_assert!(align.is_power_of_two(), "Alignment must be a power of two");
        (self + align - 1) & !(align - 1)
    }

    fn align_down(&self, align: usize) -> Self {
        debug_assert!(align.is_power_of_two(), "Alignment must be a power of two");
        self & !(align - 1)
    }

    fn is_aligned(&self, align: usize) -> bool {
        debug_assert!(align.is_power_of_two(), "Alignment must be a power of two");
        self & (align - 1) == 0
    }
}
