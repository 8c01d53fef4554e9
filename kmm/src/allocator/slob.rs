//! The SLOB (Simple List Of Blocks) allocator.
//!
//! A first-fit free-list allocator for variable-size objects. Every block, free or allocated, is
//! preceded by a [boundary tag](SLOB_ENTRY_SIZE) holding an ownership magic, the size of the
//! block and links to the previous and next entries. All entries form a single doubly-linked
//! chain.
//!
//! Backing memory is obtained from another allocator in multiples of the page size. The entries
//! carved out of one backing allocation (a *span*) are always contiguous in the chain and sorted
//! by address; spans are prepended to the chain as they are acquired.
//!
//! Free blocks are coalesced eagerly: when a block is released it is merged with the following
//! and the preceding block of the same span whenever those are free. As a consequence two
//! adjacent free blocks never coexist, which bounds fragmentation.

use core::{
    mem::{align_of, size_of},
    ptr::NonNull,
};

use bitflags::bitflags;
use log::{error, trace};
use spin::Mutex;

use crate::Align;

use super::{AllocatorError, MemAllocator};

/// The default ownership magic of slob entries.
pub const SLOB_ENTRY_MAGIC: u32 = 0xeffc_692d;

/// The size of the header preceding every block.
pub const SLOB_ENTRY_SIZE: usize = size_of::<SlobEntry>();

/// The alignment of every block, and the granularity of block sizes.
///
/// Block sizes are multiples of this value, leaving the low bits of the size field free for the
/// entry flags.
pub const SLOB_ALIGN: usize = align_of::<SlobEntry>();

type Link = Option<NonNull<SlobEntry>>;

bitflags! {
    /// Flags stored in the low bits of the size field of an entry.
    struct EntryFlags: usize {
        /// The block is allocated.
        const USED = 1 << 0;
        /// The entry is the first one of its span.
        const SPAN_HEAD = 1 << 1;
    }
}

/// The boundary tag preceding every block.
#[repr(C)]
#[derive(Debug)]
struct SlobEntry {
    magic: u32,
    prev: Link,
    size: usize,
    next: Link,
}

impl SlobEntry {
    fn size(&self) -> usize {
        self.size & !EntryFlags::all().bits()
    }

    fn flags(&self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.size)
    }

    fn is_free(&self) -> bool {
        !self.flags().contains(EntryFlags::USED)
    }

    fn is_span_head(&self) -> bool {
        self.flags().contains(EntryFlags::SPAN_HEAD)
    }

    fn set_size(&mut self, size: usize, flags: EntryFlags) {
        debug_assert!(size.is_aligned(SLOB_ALIGN));
        self.size = size | flags.bits();
    }

    /// Address one past the end of the block.
    fn end(&self) -> usize {
        self as *const Self as usize + SLOB_ENTRY_SIZE + self.size()
    }
}

/// Returns the block following the header at `entry`.
fn data_of(entry: NonNull<SlobEntry>) -> NonNull<u8> {
    // SAFETY: the block follows the header, and is never at address zero
    unsafe { NonNull::new_unchecked((entry.as_ptr() as *mut u8).add(SLOB_ENTRY_SIZE)) }
}

/// Returns the header preceding the block at `ptr`.
fn entry_of(ptr: NonNull<u8>) -> NonNull<SlobEntry> {
    // SAFETY: the header precedes the block, and is never at address zero
    unsafe { NonNull::new_unchecked(ptr.as_ptr().sub(SLOB_ENTRY_SIZE) as *mut SlobEntry) }
}

/// A free-list allocator for variable-size objects.
#[derive(Debug)]
pub struct SlobAllocator<'a> {
    base: &'a dyn MemAllocator,
    page_size: usize,
    inner: Mutex<SlobImpl>,
}

#[derive(Debug)]
struct SlobImpl {
    first: Link,
    magic: u32,
}

// SAFETY: the chain is exclusively owned by the allocator and only accessed behind its mutex.
unsafe impl Send for SlobImpl {}

impl<'a> SlobAllocator<'a> {
    /// Creates a new slob allocator drawing pages of `page_size` bytes from `base`, and tagging
    /// its entries with `magic`.
    ///
    /// Returns an `AllocatorError::InvalidPageSize` if `page_size` is not a power of two of at
    /// least four entry headers.
    pub fn new(
        base: &'a dyn MemAllocator,
        page_size: usize,
        magic: u32,
    ) -> Result<Self, AllocatorError> {
        if !page_size.is_power_of_two() || page_size < 4 * SLOB_ENTRY_SIZE {
            return Err(AllocatorError::InvalidPageSize);
        }

        Ok(Self {
            base,
            page_size,
            inner: Mutex::new(SlobImpl { first: None, magic }),
        })
    }

    /// Returns the size of the backing pages.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the ownership magic of this allocator.
    pub fn magic(&self) -> u32 {
        self.inner.lock().magic
    }
}

impl SlobImpl {
    /// Dereferences an entry, checking its ownership magic.
    ///
    /// # Safety
    ///
    /// `entry` must point to readable memory large enough for a header.
    unsafe fn entry<'e>(&self, entry: NonNull<SlobEntry>) -> &'e mut SlobEntry {
        // SAFETY: guaranteed by the caller
        let e = unsafe { &mut *entry.as_ptr() };
        if e.magic != self.magic {
            error!(
                "slob: entry {:p} has magic {:#x}, expected {:#x}",
                entry, e.magic, self.magic
            );
            panic!("slob: bad entry magic, heap corrupted or foreign pointer");
        }
        e
    }

    /// Writes a fresh entry at `at`, returning a pointer to it.
    ///
    /// # Safety
    ///
    /// `at` must be valid for writes of a header and properly aligned.
    unsafe fn write_entry(
        &self,
        at: usize,
        prev: Link,
        size: usize,
        flags: EntryFlags,
        next: Link,
    ) -> NonNull<SlobEntry> {
        let entry = at as *mut SlobEntry;
        // SAFETY: guaranteed by the caller
        unsafe {
            entry.write(SlobEntry {
                magic: self.magic,
                prev,
                size: size | flags.bits(),
                next,
            });
            NonNull::new_unchecked(entry)
        }
    }

    /// Splits `size` bytes off the front of the free entry, leaving the rest as a new free entry
    /// right after it.
    unsafe fn split(&mut self, entry: NonNull<SlobEntry>, size: usize) {
        // SAFETY: all the entries in the chain are valid
        unsafe {
            let e = self.entry(entry);
            let rest = e.size() - size - SLOB_ENTRY_SIZE;
            let at = entry.as_ptr() as usize + SLOB_ENTRY_SIZE + size;

            let tail = self.write_entry(at, Some(entry), rest, EntryFlags::empty(), e.next);
            if let Some(next) = e.next {
                self.entry(next).prev = Some(tail);
            }
            e.next = Some(tail);

            let flags = e.flags() & EntryFlags::SPAN_HEAD;
            e.set_size(size, flags);
        }
    }

    /// Finds the first free entry of at least `size` bytes and marks it as used.
    fn take_first_fit(&mut self, size: usize) -> Option<NonNull<u8>> {
        let mut cursor = self.first;

        while let Some(entry) = cursor {
            // SAFETY: all the entries in the chain are valid
            let e = unsafe { self.entry(entry) };

            if !e.is_free() || e.size() < size {
                cursor = e.next;
                continue;
            }

            if e.size() - size >= SLOB_ENTRY_SIZE + SLOB_ALIGN {
                // SAFETY: the entry is valid and large enough to be split
                unsafe { self.split(entry, size) };
            }
            // SAFETY: same entry as above
            unsafe { self.entry(entry) }.size |= EntryFlags::USED.bits();

            return Some(data_of(entry));
        }

        None
    }

    /// Formats a new span of `span` bytes at `page`, allocating `size` bytes at its start, and
    /// prepends it to the chain.
    ///
    /// # Safety
    ///
    /// `page` must be a fresh allocation of `span` bytes.
    unsafe fn push_span(&mut self, page: NonNull<u8>, span: usize, size: usize) -> NonNull<u8> {
        let at = page.as_ptr() as usize;
        let rest = span - SLOB_ENTRY_SIZE - size;
        let head_flags = EntryFlags::USED | EntryFlags::SPAN_HEAD;

        // SAFETY: the span is valid for writes, guaranteed by the caller
        let head = unsafe {
            if rest >= SLOB_ENTRY_SIZE + SLOB_ALIGN {
                let head = self.write_entry(at, None, size, head_flags, None);
                let tail = self.write_entry(
                    at + SLOB_ENTRY_SIZE + size,
                    Some(head),
                    rest - SLOB_ENTRY_SIZE,
                    EntryFlags::empty(),
                    self.first,
                );
                self.entry(head).next = Some(tail);
                if let Some(first) = self.first {
                    self.entry(first).prev = Some(tail);
                }
                head
            } else {
                // Too small to ever be reused: the head takes the whole span
                let head =
                    self.write_entry(at, None, span - SLOB_ENTRY_SIZE, head_flags, self.first);
                if let Some(first) = self.first {
                    self.entry(first).prev = Some(head);
                }
                head
            }
        };

        self.first = Some(head);
        data_of(head)
    }

    /// Marks an allocated entry as free and coalesces it with its neighbours.
    unsafe fn release(&mut self, entry: NonNull<SlobEntry>) {
        // SAFETY: the entry was validated by the caller, its neighbours are in the chain
        unsafe {
            let e = self.entry(entry);
            if e.is_free() {
                error!("slob: block {:p} is already free", data_of(entry));
                panic!("slob: double free");
            }
            e.size &= !EntryFlags::USED.bits();

            // Merge with the following block
            if let Some(next) = e.next {
                let n = self.entry(next);
                if next.as_ptr() as usize == e.end() && n.is_free() && !n.is_span_head() {
                    e.next = n.next;
                    if let Some(after) = n.next {
                        self.entry(after).prev = Some(entry);
                    }
                    e.size += SLOB_ENTRY_SIZE + n.size();
                    n.magic = 0;
                }
            }

            // Merge into the preceding block
            if !e.is_span_head() {
                if let Some(prev) = e.prev {
                    let p = self.entry(prev);
                    if p.end() == entry.as_ptr() as usize && p.is_free() {
                        p.next = e.next;
                        if let Some(after) = e.next {
                            self.entry(after).prev = Some(prev);
                        }
                        p.size += SLOB_ENTRY_SIZE + e.size();
                        e.magic = 0;
                    }
                }
            }
        }
    }
}

impl MemAllocator for SlobAllocator<'_> {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let size = size.checked_add(SLOB_ALIGN - 1)?.align_down(SLOB_ALIGN);

        let mut inner = self.inner.lock();
        if let Some(ptr) = inner.take_first_fit(size) {
            return Some(ptr);
        }

        let span = size
            .checked_add(SLOB_ENTRY_SIZE + self.page_size - 1)?
            .align_down(self.page_size);
        let page = self.base.allocate(span)?;
        trace!("slob: new span of {} bytes at {:p}", span, page);

        // SAFETY: `page` was just allocated with `span` bytes
        Some(unsafe { inner.push_span(page, span, size) })
    }

    unsafe fn release(&self, ptr: NonNull<u8>) {
        let mut inner = self.inner.lock();
        // SAFETY: the caller guarantees that `ptr` comes from this allocator
        unsafe { inner.release(entry_of(ptr)) };
    }

    unsafe fn resize(&self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        if new_size == 0 {
            // SAFETY: guaranteed by the caller
            unsafe { self.release(ptr) };
            return None;
        }
        let new_size = new_size.checked_add(SLOB_ALIGN - 1)?.align_down(SLOB_ALIGN);

        let mut inner = self.inner.lock();
        let entry = entry_of(ptr);

        // SAFETY: the caller guarantees that `ptr` comes from this allocator
        unsafe {
            let e = inner.entry(entry);
            if e.is_free() {
                error!("slob: resizing free block {:p}", ptr);
                panic!("slob: resizing a released block");
            }

            let size = e.size();
            if new_size > size {
                return None;
            }

            if size - new_size >= SLOB_ENTRY_SIZE + SLOB_ALIGN {
                // Split off the tail as an allocated block, then release it to coalesce it
                inner.split(entry, new_size);
                let e = inner.entry(entry);
                e.size |= EntryFlags::USED.bits();
                if let Some(tail) = e.next {
                    inner.entry(tail).size |= EntryFlags::USED.bits();
                    inner.release(tail);
                }
            }
        }

        Some(ptr)
    }
}

impl Drop for SlobAllocator<'_> {
    /// Releases every span back to the base allocator.
    ///
    /// Spans are given back with [`MemAllocator::unreserve`] when the base allocator supports
    /// it, and with [`MemAllocator::release`] otherwise.
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let mut cursor = inner.first.take();

        while let Some(head) = cursor {
            // Measure the span and find the next one before giving the memory back
            let mut len = 0;
            let mut entry = Some(head);
            while let Some(e) = entry {
                // Magic is not checked here, teardown must not fail
                // SAFETY: all the entries in the chain are valid
                let e = unsafe { &*e.as_ptr() };
                len += SLOB_ENTRY_SIZE + e.size();
                entry = e.next.filter(|&next| {
                    // SAFETY: all the entries in the chain are valid
                    !unsafe { &*next.as_ptr() }.is_span_head()
                });
                if entry.is_none() {
                    cursor = e.next;
                }
            }

            let ptr = head.as_ptr() as *mut u8;
            trace!("slob: returning span of {} bytes at {:p}", len, ptr);
            if !self.base.unreserve(ptr, len) {
                // SAFETY: spans are allocated from the base allocator
                unsafe { self.base.release(NonNull::new_unchecked(ptr)) };
            }
        }
    }
}
