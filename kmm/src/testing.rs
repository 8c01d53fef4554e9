//! Host-side helpers shared by the allocator tests.

use std::alloc::Layout;

use crate::{allocator::buddy::BuddyAllocator, PAGE_SIZE};

/// A page-aligned chunk of host memory, released on drop.
pub struct TestMemory {
    base: *mut u8,
    layout: Layout,
}

impl TestMemory {
    /// Allocates `size` bytes aligned to `align`.
    pub fn new(size: usize, align: usize) -> Self {
        let layout = Layout::from_size_align(size, align).unwrap();
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!base.is_null(), "host allocation failed");
        Self { base, layout }
    }

    /// Returns the base address of the chunk.
    pub fn base(&self) -> usize {
        self.base as usize
    }

    /// Returns the size of the chunk.
    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for TestMemory {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.base, self.layout) };
    }
}

/// A buddy allocator whose metadata lives in a separate host chunk, so that the whole managed
/// range is available for allocation.
pub struct TestBuddy {
    pub memory: TestMemory,
    _metadata: TestMemory,
    pub buddy: BuddyAllocator,
}

impl TestBuddy {
    /// Creates a buddy allocator managing `size` bytes.
    pub fn new(size: usize) -> Self {
        let memory = TestMemory::new(size, PAGE_SIZE << crate::allocator::buddy::MAX_ORDER);
        let metadata = TestMemory::new(BuddyAllocator::metadata_size(size).max(8), 8);

        let mut cursor = metadata.base();
        let buddy = unsafe { BuddyAllocator::new(memory.base(), size, &mut cursor) }.unwrap();
        assert_eq!(cursor, metadata.base() + BuddyAllocator::metadata_size(size));

        Self {
            memory,
            _metadata: metadata,
            buddy,
        }
    }

    /// Returns the address at `offset` bytes from the start of the managed range.
    pub fn at(&self, offset: usize) -> usize {
        self.memory.base() + offset
    }
}

/// A small deterministic pseudo-random generator (xorshift64).
pub struct XorShift(u64);

impl XorShift {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// Returns a value in `lo..hi`.
    pub fn range(&mut self, lo: usize, hi: usize) -> usize {
        lo + (self.next() as usize) % (hi - lo)
    }
}

/// Asserts that no two `(start, len)` ranges in `live` intersect.
pub fn assert_disjoint(live: &[(usize, usize)]) {
    let mut sorted = live.to_vec();
    sorted.sort_unstable();
    for pair in sorted.windows(2) {
        let (a, a_len) = pair[0];
        let (b, _) = pair[1];
        assert!(a + a_len <= b, "overlap: {:#x}+{:#x} and {:#x}", a, a_len, b);
    }
}
