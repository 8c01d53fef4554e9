//! The kernel heap.
//!
//! A single process-wide [`Kalloc`] instance, built over the global physical allocator by
//! [`init`], serves every kernel allocation: the C-style [`malloc`]/[`free`] entry points as well
//! as the `alloc` crate collections through [`KernelAllocator`].

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use kmm::allocator::{
    kalloc::{Kalloc, KallocArenas, OwnerTable},
    slob::SlobAllocator,
    MemAllocator,
};
use log::{error, info, warn};
use spin::Once;

use crate::{
    config::{kalloc_config, KALLOC_SLOB_MAGIC, KALLOC_SLOB_PAGE_SIZE},
    mm::phys,
};

static OWNERS: Once<OwnerTable<'static>> = Once::new();
static ARENAS: Once<KallocArenas<'static>> = Once::new();
static SLOB: Once<SlobAllocator<'static>> = Once::new();
static KALLOC: Once<Kalloc<'static>> = Once::new();

/// Initializes the kernel heap over the global physical allocator.
///
/// # Panics
///
/// Panics if the heap was already initialized, or if it cannot be set up.
pub fn init() {
    if KALLOC.get().is_some() {
        panic!("kalloc: already initialized");
    }

    let phys = phys::allocator();

    let owners = match OwnerTable::new(phys, phys.range()) {
        Ok(owners) => OWNERS.call_once(|| owners),
        Err(e) => {
            error!("kalloc: cannot allocate owner table: {}", e);
            panic!("kalloc: initialization failed");
        }
    };

    let arenas = ARENAS.call_once(|| KallocArenas::new(phys, owners));

    let slob = match SlobAllocator::new(arenas.slob(), KALLOC_SLOB_PAGE_SIZE, KALLOC_SLOB_MAGIC) {
        Ok(slob) => SLOB.call_once(|| slob),
        Err(e) => {
            error!("kalloc: cannot create slob allocator: {}", e);
            panic!("kalloc: initialization failed");
        }
    };

    match Kalloc::new(phys, owners, arenas, slob, kalloc_config()) {
        Ok(kalloc) => {
            KALLOC.call_once(|| kalloc);
        }
        Err(e) => {
            error!("kalloc: cannot create heap: {}", e);
            panic!("kalloc: initialization failed");
        }
    }

    info!("kalloc: kernel heap ready");
}

/// Returns the kernel heap, if initialized.
pub fn heap() -> Option<&'static Kalloc<'static>> {
    KALLOC.get()
}

/// Allocates `size` bytes from the kernel heap, returning a null pointer on failure.
pub fn malloc(size: usize) -> *mut u8 {
    let ptr = heap().and_then(|kalloc| kalloc.allocate(size));
    if ptr.is_none() && size != 0 {
        warn!("kalloc: cannot allocate {} bytes", size);
    }
    ptr.map_or(ptr::null_mut(), NonNull::as_ptr)
}

/// Allocates `size` zero-filled bytes from the kernel heap, returning a null pointer on failure.
pub fn kzmalloc(size: usize) -> *mut u8 {
    heap()
        .and_then(|kalloc| kalloc.zeroed_allocate(1, size))
        .map_or(ptr::null_mut(), NonNull::as_ptr)
}

/// Releases memory allocated from the kernel heap. Null pointers are ignored.
///
/// # Safety
///
/// `ptr` must have been returned by the kernel heap and not released since.
pub unsafe fn free(ptr: *mut u8) {
    if let (Some(ptr), Some(kalloc)) = (NonNull::new(ptr), heap()) {
        // SAFETY: guaranteed by the caller
        unsafe { kalloc.release(ptr) };
    }
}

/// The language-level allocator, backed by the kernel heap.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelAllocator;

// SAFETY: every block comes from the kernel heap, which never hands out overlapping blocks
unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        heap()
            .and_then(|kalloc| kalloc.allocate_layout(layout))
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // SAFETY: guaranteed by the caller
        unsafe { free(ptr) };
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // SAFETY: guaranteed by the caller
        let ptr = unsafe { self.alloc(layout) };
        if !ptr.is_null() {
            // SAFETY: the block holds at least `layout.size()` bytes
            unsafe { ptr.write_bytes(0, layout.size()) };
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if let (Some(block), Some(kalloc)) = (NonNull::new(ptr), heap()) {
            // SAFETY: guaranteed by the caller, and `new_size` is never zero
            if let Some(resized) = unsafe { kalloc.resize(block, new_size) } {
                return resized.as_ptr();
            }
        }

        // SAFETY: guaranteed by the caller
        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        // SAFETY: guaranteed by the caller
        let new = unsafe { self.alloc(new_layout) };
        if !new.is_null() {
            // SAFETY: both blocks are valid for the copied length and do not overlap
            unsafe {
                ptr::copy_nonoverlapping(ptr, new, layout.size().min(new_size));
                self.dealloc(ptr, layout);
            }
        }
        new
    }
}

#[cfg(all(feature = "global-alloc", not(test)))]
#[global_allocator]
static GLOBAL: KernelAllocator = KernelAllocator;
