//! The general-purpose kernel allocator.
//!
//! [`Kalloc`] routes each request to the allocator best suited for its size:
//!
//!  - up to [`MAX_CLASS_SIZE`] bytes, to one of [`SBOO_CLASSES`] pool allocators with object
//!    sizes `8 << i`,
//!  - up to half a slob page (minus the entry header), to a [`SlobAllocator`],
//!  - anything larger, straight to the physical page allocator.
//!
//! Releasing a block must find its owner again. Every page handed to a pool or to the slob goes
//! through a [`TaggingAllocator`], which records the new owner of the page in an [`OwnerTable`]
//! with one byte per physical page. Releases are dispatched by looking up that table; the magic
//! numbers kept by the pool and slob allocators only serve to detect corruption.

use core::{
    alloc::Layout,
    fmt,
    ops::Range,
    ptr::NonNull,
    sync::atomic::{AtomicU8, Ordering},
};

use log::{debug, error};

use crate::{Align, PAGE_SIZE};

use super::{
    sboo::{SbooAllocator, SbooConfig, SbooLayout, MIN_OBJECT_SIZE},
    slob::{SlobAllocator, SLOB_ALIGN, SLOB_ENTRY_SIZE},
    AllocatorError, MemAllocator,
};

/// Number of pool allocator size classes.
pub const SBOO_CLASSES: usize = 8;

/// Object size of the largest pool allocator class.
pub const MAX_CLASS_SIZE: usize = MIN_OBJECT_SIZE << (SBOO_CLASSES - 1);

/// Returns the object size of the pool class `class`.
pub const fn class_size(class: usize) -> usize {
    MIN_OBJECT_SIZE << class
}

/// Returns the smallest pool class whose objects hold `size` bytes.
pub fn class_of(size: usize) -> Option<usize> {
    if size > MAX_CLASS_SIZE {
        return None;
    }
    let objsize = size.max(MIN_OBJECT_SIZE).next_power_of_two();
    Some((objsize.trailing_zeros() - MIN_OBJECT_SIZE.trailing_zeros()) as usize)
}

/// The allocator owning a physical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// The page belongs to a block allocated straight from the physical allocator.
    Phys,
    /// The page backs the slob allocator.
    Slob,
    /// The page backs the pool allocator of the given class.
    Sboo(usize),
}

impl Owner {
    fn tag(self) -> u8 {
        match self {
            Self::Phys => 0,
            Self::Slob => 1,
            Self::Sboo(class) => 2 + class as u8,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag as usize {
            0 => Some(Self::Phys),
            1 => Some(Self::Slob),
            n if n < 2 + SBOO_CLASSES => Some(Self::Sboo(n - 2)),
            _ => None,
        }
    }
}

/// One owner tag per page of the physical allocator's range.
///
/// The table itself is allocated from the physical allocator and given back on drop.
pub struct OwnerTable<'a> {
    phys: &'a dyn MemAllocator,
    base: usize,
    tags: &'a [AtomicU8],
}

impl<'a> OwnerTable<'a> {
    /// Creates an owner table for the pages in `range`, allocating it from `phys`.
    ///
    /// Every page is initially owned by [`Owner::Phys`].
    pub fn new(phys: &'a dyn MemAllocator, range: Range<usize>) -> Result<Self, AllocatorError> {
        let base = range.start.align_down(PAGE_SIZE);
        let pages = (range.end.saturating_sub(base)) / PAGE_SIZE;
        if pages == 0 {
            return Err(AllocatorError::EmptyRegion);
        }

        let storage = phys.allocate(pages).ok_or(AllocatorError::OutOfMemory)?;

        // SAFETY: the storage was just allocated with `pages` bytes, and `AtomicU8` has the same
        // layout as `u8`
        let tags = unsafe {
            storage.as_ptr().write_bytes(Owner::Phys.tag(), pages);
            core::slice::from_raw_parts(storage.as_ptr() as *const AtomicU8, pages)
        };

        debug!("kalloc: owner table for {} pages at {:p}", pages, storage);

        Ok(Self { phys, base, tags })
    }

    /// Returns the owner of the page containing `addr`, or `None` if the page is not tracked.
    pub fn owner(&self, addr: usize) -> Option<Owner> {
        let page = addr.checked_sub(self.base)? / PAGE_SIZE;
        Owner::from_tag(self.tags.get(page)?.load(Ordering::Relaxed))
    }

    /// Records `owner` as the owner of every tracked page touched by `addr..addr + len`.
    pub fn set(&self, addr: usize, len: usize, owner: Owner) {
        let start = addr.max(self.base);
        let end = addr.saturating_add(len.max(1)).min(self.range().end);
        if start >= end {
            return;
        }

        let pages = (start - self.base) / PAGE_SIZE..(end - self.base).div_ceil(PAGE_SIZE);
        for tag in &self.tags[pages] {
            tag.store(owner.tag(), Ordering::Relaxed);
        }
    }

    /// Returns the tracked address range.
    pub fn range(&self) -> Range<usize> {
        self.base..self.base + self.tags.len() * PAGE_SIZE
    }
}

impl fmt::Debug for OwnerTable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnerTable")
            .field("range", &self.range())
            .finish()
    }
}

impl Drop for OwnerTable<'_> {
    fn drop(&mut self) {
        // SAFETY: the table was allocated from `phys` in `new`
        unsafe {
            self.phys
                .release(NonNull::new_unchecked(self.tags.as_ptr() as *mut u8))
        };
    }
}

/// A view of the physical allocator that records the owner of every page it hands out.
#[derive(Debug)]
pub struct TaggingAllocator<'a> {
    phys: &'a dyn MemAllocator,
    owners: &'a OwnerTable<'a>,
    owner: Owner,
}

impl<'a> TaggingAllocator<'a> {
    /// Creates an allocator tagging its pages with `owner`.
    pub fn new(phys: &'a dyn MemAllocator, owners: &'a OwnerTable<'a>, owner: Owner) -> Self {
        Self {
            phys,
            owners,
            owner,
        }
    }
}

impl MemAllocator for TaggingAllocator<'_> {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let ptr = self.phys.allocate(size)?;
        self.owners.set(ptr.as_ptr() as usize, size, self.owner);
        Some(ptr)
    }

    unsafe fn release(&self, ptr: NonNull<u8>) {
        self.owners.set(ptr.as_ptr() as usize, 1, Owner::Phys);
        // SAFETY: guaranteed by the caller
        unsafe { self.phys.release(ptr) };
    }
}

/// The tagging arenas backing the slob and each pool class of a [`Kalloc`].
#[derive(Debug)]
pub struct KallocArenas<'a> {
    slob: TaggingAllocator<'a>,
    classes: [TaggingAllocator<'a>; SBOO_CLASSES],
}

impl<'a> KallocArenas<'a> {
    /// Creates the arenas over `phys`, recording page owners in `owners`.
    pub fn new(phys: &'a dyn MemAllocator, owners: &'a OwnerTable<'a>) -> Self {
        Self {
            slob: TaggingAllocator::new(phys, owners, Owner::Slob),
            classes: core::array::from_fn(|class| {
                TaggingAllocator::new(phys, owners, Owner::Sboo(class))
            }),
        }
    }

    /// Returns the arena of the slob allocator.
    pub fn slob(&self) -> &TaggingAllocator<'a> {
        &self.slob
    }

    /// Returns the arena of the pool class `class`.
    pub fn class(&self, class: usize) -> &TaggingAllocator<'a> {
        &self.classes[class]
    }
}

/// Runtime configuration of a [`Kalloc`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KallocConfig {
    /// Configuration shared by every pool class.
    pub sboo: SbooConfig,
}

/// A general-purpose allocator routing requests by size.
#[derive(Debug)]
pub struct Kalloc<'a> {
    phys: &'a dyn MemAllocator,
    owners: &'a OwnerTable<'a>,
    slob: &'a SlobAllocator<'a>,
    classes: [SbooAllocator<'a>; SBOO_CLASSES],
    slob_limit: usize,
}

impl<'a> Kalloc<'a> {
    /// Creates a new general-purpose allocator.
    ///
    /// `slob` must draw its pages from `arenas.slob()`. Pool classes whose headers do not fit
    /// inside their pages keep them in `slob`.
    ///
    /// Returns an `AllocatorError` if a pool class cannot be laid out with the given
    /// configuration.
    pub fn new(
        phys: &'a dyn MemAllocator,
        owners: &'a OwnerTable<'a>,
        arenas: &'a KallocArenas<'a>,
        slob: &'a SlobAllocator<'a>,
        config: KallocConfig,
    ) -> Result<Self, AllocatorError> {
        let sboo = &config.sboo;

        let mut layouts = [SbooLayout::new(MAX_CLASS_SIZE, sboo, false)?; SBOO_CLASSES];
        for (class, layout) in layouts.iter_mut().enumerate() {
            let objsize = class_size(class);
            let external =
                !SbooAllocator::fits_internal(objsize, sboo.page_size, sboo.internal_slots);
            *layout = SbooLayout::new(objsize, sboo, external)?;
        }

        let classes = core::array::from_fn(|class| {
            SbooAllocator::with_layout(arenas.class(class), Some(slob), layouts[class])
        });

        let slob_limit = slob.page_size() / 2 - SLOB_ENTRY_SIZE;
        debug!(
            "kalloc: pools up to {} bytes, slob up to {} bytes",
            MAX_CLASS_SIZE, slob_limit
        );

        Ok(Self {
            phys,
            owners,
            slob,
            classes,
            slob_limit,
        })
    }

    /// Returns the largest request served by the slob allocator.
    pub fn slob_limit(&self) -> usize {
        self.slob_limit
    }

    /// Returns the pool allocator of class `class`.
    pub fn class(&self, class: usize) -> &SbooAllocator<'a> {
        &self.classes[class]
    }

    /// Returns the allocator owning the block at `ptr`.
    pub fn owner_of(&self, ptr: NonNull<u8>) -> Option<Owner> {
        self.owners.owner(ptr.as_ptr() as usize)
    }

    /// Allocates a memory block for `layout`.
    ///
    /// Alignments up to the page size are supported.
    pub fn allocate_layout(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.align() > PAGE_SIZE {
            return None;
        }

        // Pool objects are aligned to their size, slob blocks to SLOB_ALIGN and pages to
        // PAGE_SIZE
        let size = layout.size().max(layout.align());
        match class_of(size) {
            Some(class) => self.classes[class].allocate(size),
            None if layout.align() <= SLOB_ALIGN && size <= self.slob_limit => {
                self.slob.allocate(size)
            }
            None => self.allocate_pages(size),
        }
    }

    fn allocate_pages(&self, size: usize) -> Option<NonNull<u8>> {
        let ptr = self.phys.allocate(size)?;
        self.owners.set(ptr.as_ptr() as usize, size, Owner::Phys);
        Some(ptr)
    }

    /// Returns the allocator owning `ptr`, which must be a live block of this allocator.
    fn owner_allocator(&self, ptr: NonNull<u8>) -> &dyn MemAllocator {
        match self.owner_of(ptr) {
            Some(Owner::Phys) => self.phys,
            Some(Owner::Slob) => self.slob,
            Some(Owner::Sboo(class)) => &self.classes[class],
            None => {
                error!("kalloc: {:p} is not a heap block", ptr);
                panic!("kalloc: pointer not owned by the heap");
            }
        }
    }
}

impl MemAllocator for Kalloc<'_> {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }

        match class_of(size) {
            Some(class) => self.classes[class].allocate(size),
            None if size <= self.slob_limit => self.slob.allocate(size),
            None => self.allocate_pages(size),
        }
    }

    unsafe fn release(&self, ptr: NonNull<u8>) {
        // SAFETY: guaranteed by the caller
        unsafe { self.owner_allocator(ptr).release(ptr) };
    }

    unsafe fn resize(&self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        // SAFETY: guaranteed by the caller
        unsafe { self.owner_allocator(ptr).resize(ptr, new_size) }
    }
}
