//! A buddy allocator for physical pages.
//!
//! The allocator manages a contiguous range of memory in blocks of `PAGE_SIZE << order` bytes,
//! for `order` in `0..=MAX_ORDER`. A block of order `k` at index `i` has a single *buddy*, the
//! block at index `i ^ 1` of the same order. Allocating splits larger blocks in halves until the
//! requested order is reached; releasing merges a block with its buddy for as long as the buddy
//! is free, so that free memory always ends up in the largest possible blocks.
//!
//! All the bookkeeping lives in a metadata region handed over at construction time, whose size
//! is a pure function of the managed memory size (see [`BuddyAllocator::metadata_size`]):
//!
//!  - one free map per order, with one bit per block of that order,
//!  - one descriptor byte per page, recording the order of allocated blocks and whether the
//!    page is reserved.
//!
//! The managed memory itself is never written to. This matters because the metadata usually
//! lives inside the managed range, next to regions (firmware tables, the kernel image) that must
//! be excluded with [`reserve`](MemAllocator::reserve) before anything is allocated.
//!
//! # Complexity
//!
//! Allocation and release are `O(n / 64)` in the number of blocks of the involved orders, since
//! free blocks are located by scanning free maps a word at a time.

use core::{mem::size_of, ops::Range, ptr::NonNull};

use bitflags::bitflags;
use log::{debug, error, trace};
use spin::Mutex;

use crate::{bitmap::Bitmap, Align, PAGE_SIZE};

use super::{AllocatorError, MemAllocator};

/// The largest block order. Blocks of this order are `PAGE_SIZE << MAX_ORDER` bytes (4 MiB).
pub const MAX_ORDER: usize = 10;

const ORDERS: usize = MAX_ORDER + 1;

/// Descriptor bits holding the order of an allocated block.
const ORDER_MASK: u8 = 0x0f;

bitflags! {
    /// State of a page, stored next to its order.
    struct PageFlags: u8 {
        /// The page is the first page of an allocated block.
        const HEAD     = 1 << 4;
        /// The page is excluded from allocation.
        const RESERVED = 1 << 5;
    }
}

/// A descriptor for a managed page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct PageDescriptor(u8);

impl PageDescriptor {
    const FREE: Self = Self(0);

    fn reserved() -> Self {
        Self(PageFlags::RESERVED.bits())
    }

    fn head(order: usize) -> Self {
        Self(PageFlags::HEAD.bits() | order as u8)
    }

    fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    fn order(self) -> usize {
        (self.0 & ORDER_MASK) as usize
    }

    fn is_head(self) -> bool {
        self.flags().contains(PageFlags::HEAD)
    }

    fn is_reserved(self) -> bool {
        self.flags().contains(PageFlags::RESERVED)
    }
}

/// Placement of the free maps and page descriptors inside the metadata region.
#[derive(Debug, Clone, Copy)]
struct MetadataLayout {
    maps: [(usize, usize); ORDERS],
    descriptors: usize,
    size: usize,
}

impl MetadataLayout {
    fn new(num_pages: usize) -> Self {
        let mut maps = [(0, 0); ORDERS];
        let mut offset = 0;

        for (order, map) in maps.iter_mut().enumerate() {
            let len = (num_pages >> order).div_ceil(8);
            *map = (offset, len);
            offset = (offset + len).align_up(size_of::<u64>());
        }

        Self {
            maps,
            descriptors: offset,
            size: (offset + num_pages * size_of::<PageDescriptor>()).align_up(size_of::<u64>()),
        }
    }
}

/// A buddy allocator over a contiguous range of pages.
#[derive(Debug)]
pub struct BuddyAllocator {
    inner: Mutex<BuddyImpl>,
}

#[derive(Debug)]
struct BuddyImpl {
    base: usize,
    num_pages: usize,
    metadata: *mut u8,
    layout: MetadataLayout,
}

// SAFETY: the metadata region is exclusively owned by the allocator and only accessed behind
// its mutex.
unsafe impl Send for BuddyImpl {}

impl BuddyAllocator {
    /// Returns the size in bytes of the metadata needed to manage `mem_sz` bytes of memory.
    pub fn metadata_size(mem_sz: usize) -> usize {
        MetadataLayout::new(mem_sz / PAGE_SIZE).size
    }

    /// Returns the size in bytes of a buddy allocator managing `mem_sz` bytes of memory,
    /// including its metadata.
    ///
    /// This is the exact amount of memory that must be set aside (and later reserved) when the
    /// allocator object and its metadata are placed inside the memory they manage.
    pub fn get_size(mem_sz: usize) -> usize {
        size_of::<Self>() + Self::metadata_size(mem_sz)
    }

    /// Creates a new buddy allocator managing `mem_sz` bytes of memory starting at `base`.
    ///
    /// The allocator takes [`metadata_size(mem_sz)`](Self::metadata_size) bytes of memory at
    /// `*metadata` for its bookkeeping and advances the cursor past them. The managed size is
    /// rounded down to a multiple of the page size.
    ///
    /// Returns an `AllocatorError` if any of the following conditions are not met:
    ///  - `base` is page-aligned and the metadata cursor is word-aligned,
    ///  - `mem_sz` covers at least one page.
    ///
    /// # Safety
    ///
    /// `base..base + mem_sz` must be memory that nobody else allocates from, and the metadata
    /// region must be valid for writes and not used by anything else for the whole lifetime of
    /// the allocator. If the metadata lives inside the managed range, the caller must reserve it
    /// before allocating anything.
    pub unsafe fn new(
        base: usize,
        mem_sz: usize,
        metadata: &mut usize,
    ) -> Result<Self, AllocatorError> {
        if !base.is_aligned(PAGE_SIZE) || !metadata.is_aligned(size_of::<u64>()) {
            return Err(AllocatorError::UnalignedAddress);
        }

        let num_pages = mem_sz.align_down(PAGE_SIZE) / PAGE_SIZE;
        if num_pages == 0 {
            return Err(AllocatorError::EmptyRegion);
        }

        let layout = MetadataLayout::new(num_pages);
        let region = *metadata as *mut u8;
        *metadata += layout.size;

        // SAFETY: the caller guarantees that the metadata region is valid for writes
        unsafe { region.write_bytes(0, layout.size) };

        let mut inner = BuddyImpl {
            base,
            num_pages,
            metadata: region,
            layout,
        };
        inner.populate();

        debug!(
            "buddy: managing {:#x}..{:#x} ({} pages, {} bytes of metadata)",
            base,
            base + num_pages * PAGE_SIZE,
            num_pages,
            layout.size
        );

        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Returns the managed address range.
    pub fn range(&self) -> Range<usize> {
        let inner = self.inner.lock();
        inner.base..inner.base + inner.num_pages * PAGE_SIZE
    }

    /// Returns the number of free pages.
    pub fn free_pages(&self) -> usize {
        let mut inner = self.inner.lock();
        (0..ORDERS)
            .map(|order| inner.free_map(order).count_ones() << order)
            .sum()
    }

    /// Converts an address range into the range of page indices it touches, clipped to the
    /// managed range.
    fn page_span(&self, ptr: *mut u8, size: usize) -> Range<usize> {
        let range = self.range();
        let start = (ptr as usize).align_down(PAGE_SIZE).max(range.start);
        let end = (ptr as usize)
            .saturating_add(size)
            .saturating_add(PAGE_SIZE - 1)
            .align_down(PAGE_SIZE)
            .min(range.end);

        if start >= end {
            0..0
        } else {
            (start - range.start) / PAGE_SIZE..(end - range.start) / PAGE_SIZE
        }
    }
}

impl BuddyImpl {
    /// Number of blocks of the given order fitting in the managed range.
    fn blocks(&self, order: usize) -> usize {
        self.num_pages >> order
    }

    fn free_map(&mut self, order: usize) -> Bitmap<'_> {
        let (offset, len) = self.layout.maps[order];
        // SAFETY: the map lies within the metadata region owned by the allocator
        unsafe { Bitmap::from_raw(self.metadata.add(offset), len) }
    }

    fn descriptor(&self, page: usize) -> PageDescriptor {
        debug_assert!(page < self.num_pages);
        // SAFETY: the descriptor array lies within the metadata region owned by the allocator
        unsafe {
            self.metadata
                .add(self.layout.descriptors + page)
                .cast::<PageDescriptor>()
                .read()
        }
    }

    fn set_descriptor(&mut self, page: usize, descr: PageDescriptor) {
        debug_assert!(page < self.num_pages);
        // SAFETY: the descriptor array lies within the metadata region owned by the allocator
        unsafe {
            self.metadata
                .add(self.layout.descriptors + page)
                .cast::<PageDescriptor>()
                .write(descr)
        }
    }

    /// Marks the whole range as free, using the largest aligned blocks that fit.
    fn populate(&mut self) {
        let mut page = 0;

        while page < self.num_pages {
            let order = (0..=MAX_ORDER)
                .rev()
                .find(|&order| page % (1 << order) == 0 && page + (1 << order) <= self.num_pages)
                .unwrap_or(0);

            self.free_map(order).set(page >> order);
            page += 1 << order;
        }
    }

    /// Allocates a block of the given order, returning the index of its first page.
    fn alloc_block(&mut self, order: usize) -> Option<usize> {
        let (found, index) =
            (order..ORDERS).find_map(|k| self.free_map(k).first_one().map(|index| (k, index)))?;

        self.free_map(found).clear(index);

        // Split down to the requested order, keeping the lower half each time
        let mut index = index;
        for k in (order..found).rev() {
            index *= 2;
            self.free_map(k).set(index + 1);
        }

        let page = index << order;
        self.set_descriptor(page, PageDescriptor::head(order));

        trace!("buddy: allocated order {} block at page {}", order, page);
        Some(page)
    }

    /// Returns a free block to the free maps, merging it with its buddies.
    fn free_block(&mut self, order: usize, index: usize) {
        let mut order = order;
        let mut index = index;

        while order < MAX_ORDER {
            let buddy = index ^ 1;
            if buddy >= self.blocks(order) || !self.free_map(order).get(buddy) {
                break;
            }

            self.free_map(order).clear(buddy);
            index >>= 1;
            order += 1;
        }

        self.free_map(order).set(index);
    }

    /// Returns the free block `(order, index)` containing `page`, if any.
    fn free_block_of(&mut self, page: usize) -> Option<(usize, usize)> {
        (0..ORDERS).find_map(|order| {
            let index = page >> order;
            if index < self.blocks(order) && self.free_map(order).get(index) {
                Some((order, index))
            } else {
                None
            }
        })
    }

    /// Returns the first page of the allocated block containing `page`, if any.
    fn allocated_block_of(&self, page: usize) -> Option<usize> {
        (0..ORDERS).find_map(|order| {
            let head = page & !((1 << order) - 1);
            let descr = self.descriptor(head);
            if descr.is_head() && descr.order() == order {
                Some(head)
            } else {
                None
            }
        })
    }

    /// Removes `page` from the free block `(order, index)` containing it, returning the rest of
    /// the block to the free maps.
    fn carve(&mut self, page: usize, order: usize, index: usize) {
        self.free_map(order).clear(index);

        let mut index = index;
        for k in (0..order).rev() {
            let child = page >> k;
            let other = if child == index * 2 { child + 1 } else { child - 1 };
            self.free_map(k).set(other);
            index = child;
        }
    }

    fn reserve(&mut self, pages: Range<usize>) -> bool {
        if pages.clone().any(|page| self.allocated_block_of(page).is_some()) {
            return false;
        }

        let mut page = pages.start;
        while page < pages.end {
            if self.descriptor(page).is_reserved() {
                page += 1;
                continue;
            }

            let (order, index) = match self.free_block_of(page) {
                Some(block) => block,
                None => {
                    error!("buddy: page {} is neither free, allocated nor reserved", page);
                    panic!("buddy metadata corrupted");
                }
            };

            let block = (index << order)..((index + 1) << order);
            if block.start >= pages.start && block.end <= pages.end {
                // The whole block is covered, no need to split it
                self.free_map(order).clear(index);
                for p in block.clone() {
                    self.set_descriptor(p, PageDescriptor::reserved());
                }
                page = block.end;
            } else {
                self.carve(page, order, index);
                self.set_descriptor(page, PageDescriptor::reserved());
                page += 1;
            }
        }

        true
    }

    fn unreserve(&mut self, pages: Range<usize>) -> bool {
        if pages.is_empty() || !pages.clone().all(|page| self.descriptor(page).is_reserved()) {
            return false;
        }

        for page in pages {
            self.set_descriptor(page, PageDescriptor::FREE);
            self.free_block(0, page);
        }

        true
    }

    /// Validates `addr` as the start of an allocated block, returning its page index and order.
    fn live_block(&self, addr: usize) -> (usize, usize) {
        let end = self.base + self.num_pages * PAGE_SIZE;
        if addr < self.base || addr >= end || !addr.is_aligned(PAGE_SIZE) {
            error!("buddy: {:#x} is not a managed page", addr);
            panic!("buddy: releasing a pointer that was never allocated");
        }

        let page = (addr - self.base) / PAGE_SIZE;
        let descr = self.descriptor(page);
        if !descr.is_head() {
            error!("buddy: {:#x} is not the start of a live block", addr);
            panic!("buddy: double free or foreign pointer");
        }

        (page, descr.order())
    }
}

/// Returns the smallest order whose blocks can hold `size` bytes.
fn order_for(size: usize) -> usize {
    let pages = size.div_ceil(PAGE_SIZE);
    pages.next_power_of_two().trailing_zeros() as usize
}

impl MemAllocator for BuddyAllocator {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }

        let order = order_for(size);
        if order > MAX_ORDER {
            return None;
        }

        let mut inner = self.inner.lock();
        let page = inner.alloc_block(order)?;
        NonNull::new((inner.base + page * PAGE_SIZE) as *mut u8)
    }

    unsafe fn release(&self, ptr: NonNull<u8>) {
        let mut inner = self.inner.lock();

        let (page, order) = inner.live_block(ptr.as_ptr() as usize);
        inner.set_descriptor(page, PageDescriptor::FREE);
        inner.free_block(order, page >> order);
    }

    unsafe fn resize(&self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        if new_size == 0 {
            // SAFETY: guaranteed by the caller
            unsafe { self.release(ptr) };
            return None;
        }

        let new_order = order_for(new_size);
        let mut inner = self.inner.lock();

        let (page, order) = inner.live_block(ptr.as_ptr() as usize);
        if new_order > order {
            return None;
        }

        // Give back the upper halves, from the smallest one up
        inner.set_descriptor(page, PageDescriptor::head(new_order));
        for k in new_order..order {
            let index = (page >> k) + 1;
            inner.free_map(k).set(index);
        }

        Some(ptr)
    }

    fn reserve(&self, ptr: *mut u8, size: usize) -> bool {
        let pages = self.page_span(ptr, size);
        self.inner.lock().reserve(pages)
    }

    fn unreserve(&self, ptr: *mut u8, size: usize) -> bool {
        let pages = self.page_span(ptr, size);
        self.inner.lock().unreserve(pages)
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::{assert_disjoint, TestBuddy, TestMemory, XorShift};

    use super::*;

    const KIB: usize = 1024;
    const MIB: usize = 1024 * KIB;

    fn ptr(addr: usize) -> *mut u8 {
        addr as *mut u8
    }

    #[test]
    fn construction() {
        let t = TestBuddy::new(16 * MIB);

        assert_eq!(t.buddy.range(), t.memory.base()..t.memory.base() + 16 * MIB);
        assert_eq!(t.buddy.free_pages(), 16 * MIB / PAGE_SIZE);
    }

    #[test]
    fn unaligned_construction() {
        let memory = TestMemory::new(4 * PAGE_SIZE, PAGE_SIZE);
        let metadata = TestMemory::new(64, 8);

        let mut cursor = metadata.base();
        assert_eq!(
            unsafe { BuddyAllocator::new(memory.base() + 8, 3 * PAGE_SIZE, &mut cursor) }
                .unwrap_err(),
            AllocatorError::UnalignedAddress
        );

        let mut cursor = metadata.base() + 1;
        assert_eq!(
            unsafe { BuddyAllocator::new(memory.base(), 3 * PAGE_SIZE, &mut cursor) }.unwrap_err(),
            AllocatorError::UnalignedAddress
        );

        let mut cursor = metadata.base();
        assert_eq!(
            unsafe { BuddyAllocator::new(memory.base(), PAGE_SIZE - 1, &mut cursor) }.unwrap_err(),
            AllocatorError::EmptyRegion
        );
        assert_eq!(cursor, metadata.base());
    }

    #[test]
    fn metadata_size_is_deterministic() {
        let a = BuddyAllocator::metadata_size(16 * MIB);
        let b = BuddyAllocator::metadata_size(16 * MIB + 100);

        assert_eq!(a, b);
        assert!(a >= 16 * MIB / PAGE_SIZE);
        assert_eq!(a % 8, 0);
        assert_eq!(
            BuddyAllocator::get_size(16 * MIB),
            size_of::<BuddyAllocator>() + a
        );
        assert!(BuddyAllocator::metadata_size(32 * MIB) > a);
    }

    #[test]
    fn reserved_prefix_is_skipped() {
        let t = TestBuddy::new(16 * MIB);

        assert!(t.buddy.reserve(ptr(t.at(0)), MIB));

        let p = t.buddy.allocate(4 * KIB).expect("allocation failed");
        assert!(p.as_ptr() as usize >= t.at(MIB));
        assert_eq!(p.as_ptr() as usize, t.at(MIB));
    }

    #[test]
    fn lowest_address_first() {
        let t = TestBuddy::new(16 * MIB);

        let p1 = t.buddy.allocate(4 * KIB).unwrap();
        let p2 = t.buddy.allocate(4 * KIB).unwrap();
        let p3 = t.buddy.allocate(16 * KIB).unwrap();

        assert_eq!(p1.as_ptr() as usize, t.at(0));
        assert_eq!(p2.as_ptr() as usize, t.at(4 * KIB));
        assert_eq!(p3.as_ptr() as usize, t.at(16 * KIB));
    }

    #[test]
    fn split_and_merge() {
        let t = TestBuddy::new(16 * MIB);
        let total = t.buddy.free_pages();

        let small = t.buddy.allocate(1).unwrap();
        assert_eq!(t.buddy.free_pages(), total - 1);

        let medium = t.buddy.allocate(64 * KIB).unwrap();
        assert_eq!(t.buddy.free_pages(), total - 1 - 16);

        unsafe {
            t.buddy.release(small);
            t.buddy.release(medium);
        }
        assert_eq!(t.buddy.free_pages(), total);

        // Everything merged back: a top-order block is available at the start again
        let top = t.buddy.allocate(PAGE_SIZE << MAX_ORDER).unwrap();
        assert_eq!(top.as_ptr() as usize, t.at(0));
    }

    #[test]
    fn round_trip_returns_same_address() {
        let t = TestBuddy::new(16 * MIB);
        let _hold = t.buddy.allocate(12 * KIB).unwrap();

        let p = t.buddy.allocate(20 * KIB).unwrap();
        unsafe { t.buddy.release(p) };
        let q = t.buddy.allocate(20 * KIB).unwrap();

        assert_eq!(p, q);
    }

    #[test]
    fn oversized_requests_fail() {
        let t = TestBuddy::new(16 * MIB);

        assert_eq!(t.buddy.allocate(0), None);
        assert_eq!(t.buddy.allocate((PAGE_SIZE << MAX_ORDER) + 1), None);
        assert_eq!(t.buddy.allocate(8 * MIB), None);
        assert!(t.buddy.allocate(PAGE_SIZE << MAX_ORDER).is_some());
    }

    #[test]
    fn exhaustion() {
        let t = TestBuddy::new(16 * MIB);

        let blocks: Vec<_> = (0..4)
            .map(|_| t.buddy.allocate(4 * MIB).expect("allocation failed"))
            .collect();
        assert_eq!(t.buddy.allocate(PAGE_SIZE), None);
        assert_eq!(t.buddy.free_pages(), 0);

        unsafe { t.buddy.release(blocks[2]) };
        assert_eq!(t.buddy.allocate(4 * MIB), Some(blocks[2]));
    }

    #[test]
    fn non_power_of_two_region() {
        // 4 MiB + 3 pages: one top-order block, then an order-1 and an order-0 block
        let size = 4 * MIB + 3 * PAGE_SIZE;
        let t = TestBuddy::new(size);
        assert_eq!(t.buddy.free_pages(), size / PAGE_SIZE);

        let top = t.buddy.allocate(4 * MIB).unwrap();
        let pair = t.buddy.allocate(8 * KIB).unwrap();
        let single = t.buddy.allocate(4 * KIB).unwrap();

        assert_eq!(top.as_ptr() as usize, t.at(0));
        assert_eq!(pair.as_ptr() as usize, t.at(4 * MIB));
        assert_eq!(single.as_ptr() as usize, t.at(4 * MIB + 8 * KIB));
        assert_eq!(t.buddy.allocate(4 * KIB), None);
    }

    #[test]
    fn reservation_exclusion() {
        let t = TestBuddy::new(16 * MIB);
        let hole = t.at(5 * MIB + 12 * KIB)..t.at(6 * MIB + 4 * KIB);

        assert!(t.buddy.reserve(ptr(hole.start), hole.end - hole.start));
        assert_eq!(
            t.buddy.free_pages(),
            16 * MIB / PAGE_SIZE - (hole.end - hole.start) / PAGE_SIZE
        );

        let mut live = Vec::new();
        while let Some(p) = t.buddy.allocate(PAGE_SIZE) {
            let addr = p.as_ptr() as usize;
            assert!(addr + PAGE_SIZE <= hole.start || addr >= hole.end);
            live.push(p);
        }
        assert_eq!(
            live.len(),
            t.buddy.range().len() / PAGE_SIZE - (hole.end - hole.start) / PAGE_SIZE
        );

        for p in live {
            unsafe { t.buddy.release(p) };
        }

        assert!(t.buddy.unreserve(ptr(hole.start), hole.end - hole.start));
        assert_eq!(t.buddy.free_pages(), 16 * MIB / PAGE_SIZE);
        assert_eq!(t.buddy.allocate(4 * MIB), NonNull::new(ptr(t.at(0))));
    }

    #[test]
    fn reserve_rounds_outwards_and_is_idempotent() {
        let t = TestBuddy::new(16 * MIB);

        // Touches pages 1 and 2
        assert!(t.buddy.reserve(ptr(t.at(PAGE_SIZE + 100)), PAGE_SIZE));
        assert!(t.buddy.reserve(ptr(t.at(PAGE_SIZE)), 2 * PAGE_SIZE));
        assert_eq!(t.buddy.free_pages(), 16 * MIB / PAGE_SIZE - 2);

        // Outside of the managed range: nothing to do
        assert!(t.buddy.reserve(ptr(t.at(32 * MIB)), MIB));
        assert!(t.buddy.reserve(ptr(0), 0));
    }

    #[test]
    fn reserve_over_live_allocation_fails() {
        let t = TestBuddy::new(16 * MIB);

        let p = t.buddy.allocate(16 * KIB).unwrap();
        let before = t.buddy.free_pages();

        assert!(!t.buddy.reserve(ptr(p.as_ptr() as usize + PAGE_SIZE), 2 * PAGE_SIZE));
        assert_eq!(t.buddy.free_pages(), before);
    }

    #[test]
    fn unreserve_requires_reserved_pages() {
        let t = TestBuddy::new(16 * MIB);

        let p = t.buddy.allocate(PAGE_SIZE).unwrap();
        assert!(!t.buddy.unreserve(p.as_ptr(), PAGE_SIZE));
        assert!(!t.buddy.unreserve(ptr(t.at(64 * KIB)), PAGE_SIZE));

        assert!(t.buddy.reserve(ptr(t.at(64 * KIB)), PAGE_SIZE));
        assert!(!t.buddy.unreserve(ptr(t.at(64 * KIB)), 2 * PAGE_SIZE));
        assert!(t.buddy.unreserve(ptr(t.at(64 * KIB)), PAGE_SIZE));
    }

    #[test]
    fn resize_in_place() {
        let t = TestBuddy::new(16 * MIB);
        let total = t.buddy.free_pages();

        let p = t.buddy.allocate(64 * KIB).unwrap();
        unsafe {
            assert_eq!(t.buddy.resize(p, 60 * KIB), Some(p));
            assert_eq!(t.buddy.resize(p, 128 * KIB), None);
            assert_eq!(t.buddy.resize(p, 8 * KIB), Some(p));
        }
        assert_eq!(t.buddy.free_pages(), total - 2);

        // The released upper halves are reusable
        let q = t.buddy.allocate(8 * KIB).unwrap();
        assert_eq!(q.as_ptr() as usize, p.as_ptr() as usize + 8 * KIB);

        unsafe {
            t.buddy.release(q);
            assert_eq!(t.buddy.resize(p, 0), None);
        }
        assert_eq!(t.buddy.free_pages(), total);
    }

    #[test]
    fn no_overlap_under_random_workload() {
        let t = TestBuddy::new(16 * MIB);
        let mut rng = XorShift::new(0x5eed);
        let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();

        for _ in 0..2000 {
            if live.is_empty() || rng.range(0, 3) > 0 {
                let size = rng.range(1, 256 * KIB);
                if let Some(p) = t.buddy.allocate(size) {
                    live.push((p, size));
                }
            } else {
                let (p, _) = live.swap_remove(rng.range(0, live.len()));
                unsafe { t.buddy.release(p) };
            }

            if live.len() % 64 == 0 {
                let ranges: Vec<_> = live
                    .iter()
                    .map(|(p, size)| (p.as_ptr() as usize, *size))
                    .collect();
                assert_disjoint(&ranges);
            }
        }

        for (p, _) in live {
            unsafe { t.buddy.release(p) };
        }
        assert_eq!(t.buddy.free_pages(), 16 * MIB / PAGE_SIZE);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let t = TestBuddy::new(MIB);

        let p = t.buddy.allocate(PAGE_SIZE).unwrap();
        unsafe {
            t.buddy.release(p);
            t.buddy.release(p);
        }
    }

    #[test]
    #[should_panic(expected = "never allocated")]
    fn foreign_pointer_is_fatal() {
        let t = TestBuddy::new(MIB);
        unsafe { t.buddy.release(NonNull::new(ptr(t.at(2 * MIB))).unwrap()) };
    }
}
