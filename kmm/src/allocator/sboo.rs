//! The SBOO (Simple Bitmap Of Objects) allocator.
//!
//! A pool allocator for objects of a single, fixed power-of-two size. Memory is drawn from an
//! *arena* allocator one page at a time; every page is a *pool* of equally-sized slots whose
//! occupancy is tracked by a bitmap.
//!
//! Every pool page starts with a [`SBOO_PAGE_MAGIC`] tag, which identifies the page and points to
//! the pool header. The header and its bitmap are stored either right after the tag, inside the
//! first slots of the page (*internal* mode), or in a separate allocation (*external* mode). The
//! slots covered by the tag (and by the header in internal mode) are marked as used when the pool
//! is created and are never handed out.
//!
//! Pools are kept in two lists: *partial* pools have at least one free slot, *full* pools have
//! none. Allocations are always served from the first partial pool.

use core::{
    mem::{align_of, size_of},
    ptr::NonNull,
};

use log::{debug, error, trace};
use spin::Mutex;

use crate::{bitmap::Bitmap, Align, PAGE_SIZE};

use super::{AllocatorError, MemAllocator};

/// The magic tagging every pool page.
pub const SBOO_PAGE_MAGIC: u32 = 0x43a5_dc0e;

/// The smallest supported object size.
pub const MIN_OBJECT_SIZE: usize = 8;

/// Runtime configuration of a [`SbooAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbooConfig {
    /// Size of the pool pages.
    pub page_size: usize,
    /// Magic stored at the start of every pool page.
    pub magic: u32,
    /// Maximum number of slots that the page tag, the pool header and the bitmap may take for
    /// the bitmap to be stored inside the page.
    pub internal_slots: usize,
}

impl Default for SbooConfig {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            magic: SBOO_PAGE_MAGIC,
            internal_slots: 1,
        }
    }
}

type Link = Option<NonNull<Pool>>;

/// The tag at the start of every pool page.
#[repr(C)]
#[derive(Debug)]
struct PageTag {
    magic: u32,
    class: u32,
    pool: NonNull<Pool>,
}

/// A pool header, immediately followed by its bitmap.
#[repr(C)]
#[derive(Debug)]
struct Pool {
    page: NonNull<u8>,
    prev: Link,
    next: Link,
    free: u32,
    full: bool,
}

/// An intrusive doubly-linked list of pools.
#[derive(Debug, Default)]
struct PoolList {
    head: Link,
}

impl PoolList {
    fn first(&self) -> Link {
        self.head
    }

    /// # Safety
    ///
    /// `pool` must be a valid pool header not linked in any list.
    unsafe fn push_front(&mut self, pool: NonNull<Pool>) {
        // SAFETY: guaranteed by the caller, and all linked pools are valid
        unsafe {
            let p = &mut *pool.as_ptr();
            p.prev = None;
            p.next = self.head;
            if let Some(head) = self.head {
                (*head.as_ptr()).prev = Some(pool);
            }
        }
        self.head = Some(pool);
    }

    /// # Safety
    ///
    /// `pool` must be linked in this list.
    unsafe fn remove(&mut self, pool: NonNull<Pool>) {
        // SAFETY: guaranteed by the caller, and all linked pools are valid
        unsafe {
            let p = &mut *pool.as_ptr();
            match p.prev {
                Some(prev) => (*prev.as_ptr()).next = p.next,
                None => self.head = p.next,
            }
            if let Some(next) = p.next {
                (*next.as_ptr()).prev = p.prev;
            }
            p.prev = None;
            p.next = None;
        }
    }

    fn pop_front(&mut self) -> Link {
        let pool = self.head?;
        // SAFETY: the pool is linked in this list
        unsafe { self.remove(pool) };
        Some(pool)
    }

    fn iter(&self) -> impl Iterator<Item = NonNull<Pool>> + '_ {
        // SAFETY: all linked pools are valid
        core::iter::successors(self.head, |pool| unsafe { pool.as_ref() }.next)
    }
}

/// The validated placement of objects, tag and header within a pool page.
#[derive(Debug, Clone, Copy)]
pub struct SbooLayout {
    page_size: usize,
    magic: u32,
    objsize: usize,
    capacity: usize,
    bitmap_len: usize,
    header_slots: usize,
    internal: bool,
}

impl SbooLayout {
    /// Computes the pool layout for `objsize`-byte objects.
    ///
    /// Pool headers are stored inside the page unless `external` is set or they do not fit in
    /// the configured number of slots.
    pub fn new(
        objsize: usize,
        config: &SbooConfig,
        external: bool,
    ) -> Result<Self, AllocatorError> {
        if !config.page_size.is_power_of_two() {
            return Err(AllocatorError::InvalidPageSize);
        }
        if !objsize.is_power_of_two() || objsize < MIN_OBJECT_SIZE || objsize > config.page_size / 2
        {
            return Err(AllocatorError::InvalidObjectSize);
        }

        let capacity = config.page_size / objsize;
        let bitmap_len = capacity.div_ceil(8);
        let internal = !external
            && SbooAllocator::fits_internal(objsize, config.page_size, config.internal_slots);

        let header_bytes = if internal {
            size_of::<PageTag>() + size_of::<Pool>() + bitmap_len
        } else {
            size_of::<PageTag>()
        };
        let header_slots = header_bytes.div_ceil(objsize);

        if header_slots >= capacity {
            return Err(AllocatorError::InvalidObjectSize);
        }

        Ok(Self {
            page_size: config.page_size,
            magic: config.magic,
            objsize,
            capacity,
            bitmap_len,
            header_slots,
            internal,
        })
    }

    /// Number of slots that can be handed out in a pool.
    fn usable(&self) -> usize {
        self.capacity - self.header_slots
    }
}

/// A pool allocator for fixed-size objects.
#[derive(Debug)]
pub struct SbooAllocator<'a> {
    arena: &'a dyn MemAllocator,
    bitmap_allocator: Option<&'a dyn MemAllocator>,
    layout: SbooLayout,
    class: u32,
    inner: Mutex<SbooImpl>,
}

#[derive(Debug, Default)]
struct SbooImpl {
    partial: PoolList,
    full: PoolList,
    pools: usize,
    population: usize,
}

// SAFETY: the pools are exclusively owned by the allocator and only accessed behind its mutex.
unsafe impl Send for SbooImpl {}

impl<'a> SbooAllocator<'a> {
    /// Creates a new pool allocator for objects of `objsize` bytes.
    ///
    /// Pool pages are drawn from `arena`, which must return blocks aligned to the configured page
    /// size. External pool headers are drawn from `bitmap_allocator`, or from `arena` when none
    /// is given and the header does not fit inside the page.
    ///
    /// Returns an `AllocatorError` if any of the following conditions are not met:
    ///  - the page size is a power of two,
    ///  - `objsize` is a power of two between [`MIN_OBJECT_SIZE`] and half the page size,
    ///  - a page holds at least one object besides its tag.
    pub fn new(
        arena: &'a dyn MemAllocator,
        bitmap_allocator: Option<&'a dyn MemAllocator>,
        objsize: usize,
        config: SbooConfig,
    ) -> Result<Self, AllocatorError> {
        let layout = SbooLayout::new(objsize, &config, bitmap_allocator.is_some())?;
        Ok(Self::with_layout(arena, bitmap_allocator, layout))
    }

    /// Creates a new pool allocator with a precomputed layout.
    ///
    /// `bitmap_allocator` is ignored when the layout stores headers inside the pages.
    pub fn with_layout(
        arena: &'a dyn MemAllocator,
        bitmap_allocator: Option<&'a dyn MemAllocator>,
        layout: SbooLayout,
    ) -> Self {
        debug!(
            "sboo: {}-byte objects, {} per page, {} bitmap",
            layout.objsize,
            layout.usable(),
            if layout.internal {
                "internal"
            } else {
                "external"
            }
        );

        Self {
            arena,
            bitmap_allocator,
            layout,
            class: layout.objsize.trailing_zeros(),
            inner: Mutex::new(SbooImpl::default()),
        }
    }

    /// Returns `true` if the page tag, the pool header and the bitmap for `objsize`-byte objects
    /// fit within `internal_slots` slots of a `page_size` page.
    pub fn fits_internal(objsize: usize, page_size: usize, internal_slots: usize) -> bool {
        let bitmap_len = (page_size / objsize).div_ceil(8);
        size_of::<PageTag>() + size_of::<Pool>() + bitmap_len <= internal_slots * objsize
    }

    /// Returns the size of the objects served by this allocator.
    pub fn object_size(&self) -> usize {
        self.layout.objsize
    }

    /// Returns `true` if pool bitmaps are stored inside the pool pages.
    pub fn is_internal(&self) -> bool {
        self.layout.internal
    }

    /// Returns the number of objects that fit in a pool.
    pub fn objects_per_pool(&self) -> usize {
        self.layout.usable()
    }

    /// Returns the number of allocated objects.
    pub fn population(&self) -> usize {
        self.inner.lock().population
    }

    /// Returns the number of pools.
    pub fn pools(&self) -> usize {
        self.inner.lock().pools
    }

    /// Returns the number of pools without free slots.
    pub fn full_pools(&self) -> usize {
        self.inner.lock().full.iter().count()
    }

    fn header_allocator(&self) -> &'a dyn MemAllocator {
        self.bitmap_allocator.unwrap_or(self.arena)
    }

    /// Returns the bitmap of a pool.
    ///
    /// # Safety
    ///
    /// `pool` must be a valid pool header of this allocator, and the returned bitmap must be the
    /// only live view over it.
    unsafe fn bitmap<'p>(&self, pool: NonNull<Pool>) -> Bitmap<'p> {
        // SAFETY: the bitmap immediately follows the header
        unsafe {
            Bitmap::from_raw(
                (pool.as_ptr() as *mut u8).add(size_of::<Pool>()),
                self.layout.bitmap_len,
            )
        }
    }

    /// Allocates and formats a new pool.
    fn new_pool(&self) -> Option<NonNull<Pool>> {
        let layout = &self.layout;

        let page = self.arena.allocate(layout.page_size)?;
        if !(page.as_ptr() as usize).is_aligned(layout.page_size) {
            error!("sboo: arena returned unaligned page {:p}", page);
            // SAFETY: the page was just allocated from the arena
            unsafe { self.arena.release(page) };
            return None;
        }

        let header = if layout.internal {
            // SAFETY: the header fits within the page
            unsafe { NonNull::new_unchecked(page.as_ptr().add(size_of::<PageTag>())) }
        } else {
            let headers = self.header_allocator();
            let header = headers.allocate(size_of::<Pool>() + layout.bitmap_len);
            match header {
                Some(h) if (h.as_ptr() as usize).is_aligned(align_of::<Pool>()) => h,
                other => {
                    // SAFETY: both blocks were just allocated from their allocators
                    unsafe {
                        if let Some(h) = other {
                            headers.release(h);
                        }
                        self.arena.release(page);
                    }
                    return None;
                }
            }
        };
        let pool = header.cast::<Pool>();

        // SAFETY: the page and the header are fresh allocations large enough for their contents
        unsafe {
            page.cast::<PageTag>().as_ptr().write(PageTag {
                magic: self.layout.magic,
                class: self.class,
                pool,
            });
            pool.as_ptr().write(Pool {
                page,
                prev: None,
                next: None,
                free: layout.usable() as u32,
                full: false,
            });

            let mut bitmap = self.bitmap(pool);
            bitmap.fill(0);
            (0..layout.header_slots).for_each(|slot| bitmap.set(slot));
            (layout.capacity..bitmap.bits()).for_each(|bit| bitmap.set(bit));
        }

        trace!("sboo({}): new pool at {:p}", layout.objsize, page);
        Some(pool)
    }

    /// Returns the pool owning `page`, checking the page tag.
    ///
    /// # Safety
    ///
    /// `page` must be readable.
    unsafe fn pool_of(&self, page: usize) -> NonNull<Pool> {
        // SAFETY: guaranteed by the caller
        let tag = unsafe { &*(page as *const PageTag) };

        if tag.magic != self.layout.magic || tag.class != self.class {
            error!(
                "sboo({}): page {:#x} has magic {:#x}/{}, expected {:#x}/{}",
                self.layout.objsize, page, tag.magic, tag.class, self.layout.magic, self.class
            );
            panic!("sboo: bad page magic, heap corrupted or foreign pointer");
        }

        // SAFETY: the tag of a pool page points to its header
        if unsafe { tag.pool.as_ref() }.page.as_ptr() as usize != page {
            error!("sboo: pool header {:p} does not describe {:#x}", tag.pool, page);
            panic!("sboo: pool header corrupted");
        }

        tag.pool
    }

    /// Returns the slot index of `ptr` in its pool page, checking that it is an object slot.
    fn slot_of(&self, ptr: NonNull<u8>, page: usize) -> usize {
        let layout = &self.layout;
        let offset = ptr.as_ptr() as usize - page;
        let slot = offset / layout.objsize;

        if !offset.is_aligned(layout.objsize) || slot < layout.header_slots {
            error!("sboo({}): {:p} is not an object slot", layout.objsize, ptr);
            panic!("sboo: pointer is not an object slot");
        }

        slot
    }
}

impl MemAllocator for SbooAllocator<'_> {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 || size > self.layout.objsize {
            return None;
        }

        let mut inner = self.inner.lock();

        let pool = match inner.partial.first() {
            Some(pool) => pool,
            None => {
                let pool = self.new_pool()?;
                // SAFETY: the pool was just created
                unsafe { inner.partial.push_front(pool) };
                inner.pools += 1;
                pool
            }
        };

        // SAFETY: the pool is a valid header of this allocator
        let (page, slot, full) = unsafe {
            let mut bitmap = self.bitmap(pool);
            let slot = match bitmap.first_zero() {
                Some(slot) => slot,
                None => {
                    error!("sboo: partial pool {:p} has no free slot", pool);
                    panic!("sboo: pool lists corrupted");
                }
            };
            bitmap.set(slot);

            let p = &mut *pool.as_ptr();
            p.free -= 1;
            p.full = p.free == 0;
            (p.page, slot, p.full)
        };

        if full {
            // SAFETY: the pool is the head of the partial list
            unsafe {
                inner.partial.remove(pool);
                inner.full.push_front(pool);
            }
            trace!("sboo({}): pool {:p} is full", self.layout.objsize, page);
        }
        inner.population += 1;

        // SAFETY: the slot lies within the page
        Some(unsafe { NonNull::new_unchecked(page.as_ptr().add(slot * self.layout.objsize)) })
    }

    unsafe fn release(&self, ptr: NonNull<u8>) {
        let page = (ptr.as_ptr() as usize).align_down(self.layout.page_size);
        let mut inner = self.inner.lock();

        // SAFETY: the caller guarantees that `ptr` comes from this allocator
        let pool = unsafe { self.pool_of(page) };
        let slot = self.slot_of(ptr, page);

        // SAFETY: the pool is a valid header of this allocator
        let was_full = unsafe {
            let mut bitmap = self.bitmap(pool);
            if !bitmap.get(slot) {
                error!("sboo({}): object {:p} is already free", self.layout.objsize, ptr);
                panic!("sboo: double free");
            }
            bitmap.clear(slot);

            let p = &mut *pool.as_ptr();
            p.free += 1;
            core::mem::replace(&mut p.full, false)
        };

        if was_full {
            // SAFETY: a full pool is linked in the full list
            unsafe {
                inner.full.remove(pool);
                inner.partial.push_front(pool);
            }
            trace!("sboo({}): pool {:#x} is partial", self.layout.objsize, page);
        }
        inner.population -= 1;
    }

    unsafe fn resize(&self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        if new_size == 0 {
            // SAFETY: guaranteed by the caller
            unsafe { self.release(ptr) };
            return None;
        }

        let page = (ptr.as_ptr() as usize).align_down(self.layout.page_size);
        let _guard = self.inner.lock();
        // SAFETY: the caller guarantees that `ptr` comes from this allocator
        unsafe { self.pool_of(page) };
        self.slot_of(ptr, page);

        (new_size <= self.layout.objsize).then_some(ptr)
    }
}

impl Drop for SbooAllocator<'_> {
    /// Returns every pool page, and every external pool header, to its allocator.
    fn drop(&mut self) {
        let internal = self.layout.internal;
        let headers = self.header_allocator();
        let inner = self.inner.get_mut();

        for list in [&mut inner.partial, &mut inner.full] {
            while let Some(pool) = list.pop_front() {
                // SAFETY: linked pools are valid, and were allocated by the arena (and the
                // header allocator in external mode)
                unsafe {
                    let page = pool.as_ref().page;
                    if !internal {
                        headers.release(pool.cast());
                    }
                    self.arena.release(page);
                }
            }
        }

        inner.pools = 0;
    }
}
