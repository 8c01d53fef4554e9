//! Memory layout handed over by the boot stage.

use core::ops::Range;

/// A memory range reserved by the machine, which must never be allocated.
///
/// Ranges are chained in a singly-linked list, in no particular order.
#[derive(Debug, Clone, Copy)]
pub struct ReservedRange<'a> {
    /// The lowest address of the range.
    pub start: usize,
    /// One past the highest address of the range.
    pub end: usize,
    /// The next range in the list.
    pub next: Option<&'a ReservedRange<'a>>,
}

impl<'a> ReservedRange<'a> {
    /// Creates a new range, linked in front of `next`.
    pub const fn new(start: usize, end: usize, next: Option<&'a ReservedRange<'a>>) -> Self {
        Self { start, end, next }
    }

    /// Returns the range as a [`Range`].
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// Description of the physical memory of the machine.
#[derive(Debug, Clone)]
pub struct MemoryDescription<'a> {
    /// The lowest address that may be managed.
    pub mem_lower: usize,
    /// One past the highest usable address.
    pub mem_upper: usize,
    /// Machine reserved ranges. The kernel image is not part of this list.
    pub reserved: Option<&'a ReservedRange<'a>>,
    /// The range occupied by the loaded kernel image.
    pub kernel_image: Range<usize>,
    /// The address the kernel was loaded at.
    pub load_offset: usize,
}

impl<'a> MemoryDescription<'a> {
    /// Returns an iterator over the machine reserved ranges.
    pub fn reserved(&self) -> ReservedIter<'a> {
        ReservedIter {
            next: self.reserved,
        }
    }

    /// Returns an iterator over every range that must not be allocated: the machine reserved
    /// ranges and the kernel image.
    pub fn excluded(&self) -> impl Iterator<Item = Range<usize>> + 'a {
        self.reserved()
            .map(ReservedRange::range)
            .chain(core::iter::once(self.kernel_image.clone()))
    }
}

/// An iterator over a list of [`ReservedRange`].
#[derive(Debug, Clone)]
pub struct ReservedIter<'a> {
    next: Option<&'a ReservedRange<'a>>,
}

impl<'a> Iterator for ReservedIter<'a> {
    type Item = &'a ReservedRange<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.next;
        Some(current)
    }
}

/// Returns `true` if the two ranges share at least one address.
pub fn overlaps(a: &Range<usize>, b: &Range<usize>) -> bool {
    a.start.max(b.start) < a.end.min(b.end)
}
