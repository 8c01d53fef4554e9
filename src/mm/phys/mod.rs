//! Physical memory handling.
//!
//! The whole physical memory is managed by a single buddy allocator. Since there is no other
//! allocator yet at this point, the buddy allocator object and its metadata are placed inside
//! the very memory they manage, and that region is then reserved so that it is never handed out.

use core::{mem::size_of, ops::Range, ptr::NonNull};

use kmm::{
    allocator::{buddy::BuddyAllocator, MemAllocator},
    Align, PAGE_SIZE,
};
use log::{debug, error, info};
use spin::Once;

use crate::boot::{overlaps, MemoryDescription};

/// Global physical allocator.
static MAIN: Once<&'static BuddyAllocator> = Once::new();

/// Returns the range managed by the physical allocator for `desc`.
pub fn managed_range(desc: &MemoryDescription<'_>) -> Range<usize> {
    desc.mem_lower.align_up(PAGE_SIZE)..desc.mem_upper.align_down(PAGE_SIZE)
}

/// Finds room for `size` bytes of allocator data within the managed range.
///
/// The search starts at the load offset and skips past any reserved range or the kernel image
/// in the way. When it runs past the end of memory it restarts once from the bottom.
pub fn place(desc: &MemoryDescription<'_>, size: usize) -> Option<usize> {
    let managed = managed_range(desc);
    let mut candidate = desc.load_offset.align_up(PAGE_SIZE).max(managed.start);
    let mut wrapped = false;

    loop {
        let end = match candidate.checked_add(size) {
            Some(end) if end <= managed.end => end,
            _ if wrapped => return None,
            _ => {
                wrapped = true;
                candidate = managed.start;
                continue;
            }
        };

        match desc.excluded().find(|r| overlaps(r, &(candidate..end))) {
            Some(r) => candidate = r.end.align_up(PAGE_SIZE),
            None => return Some(candidate),
        }
    }
}

/// Builds a buddy allocator over the memory described by `desc`, storing it inside that
/// memory.
///
/// The region holding the allocator, every reserved range and the kernel image are reserved
/// before returning.
///
/// # Panics
///
/// Panics if the allocator cannot be placed, or if its own region cannot be reserved.
///
/// # Safety
///
/// The managed range must be valid memory that is not used by anything else for `'a`.
pub unsafe fn build<'a>(desc: &MemoryDescription<'_>) -> &'a BuddyAllocator {
    let managed = managed_range(desc);
    let mem_sz = managed.end.saturating_sub(managed.start);
    let size = BuddyAllocator::get_size(mem_sz);

    let base = match place(desc, size) {
        Some(base) => base,
        None => {
            error!(
                "phys: no room for {:#x} bytes of allocator in {:#x}..{:#x}",
                size, managed.start, managed.end
            );
            panic!("phys: no room for the buddy allocator");
        }
    };

    let mut cursor = base + size_of::<BuddyAllocator>();
    // SAFETY: `base..base + size` lies within the managed range and is not used by anything
    let buddy = match unsafe { BuddyAllocator::new(managed.start, mem_sz, &mut cursor) } {
        Ok(buddy) => buddy,
        Err(e) => {
            error!("phys: cannot create buddy allocator: {}", e);
            panic!("phys: buddy allocator construction failed");
        }
    };

    if cursor != base + size {
        error!(
            "phys: metadata ends at {:#x}, expected {:#x}",
            cursor,
            base + size
        );
        panic!("phys: buddy metadata placement mismatch");
    }

    let ptr = base as *mut BuddyAllocator;
    // SAFETY: the region is valid and properly aligned for the allocator object
    let buddy: &'a BuddyAllocator = unsafe {
        ptr.write(buddy);
        &*ptr
    };

    info!(
        "phys: buddy allocator at {:#x} ({:#x} bytes), managing {:#x}..{:#x}",
        base, size, managed.start, managed.end
    );

    reserve_on(buddy, base, size);
    for excluded in desc.excluded() {
        let start = excluded.start.max(managed.start);
        let end = excluded.end.min(managed.end);
        if start < end {
            debug!("phys: reserving {:#x}..{:#x}", start, end);
            reserve_on(buddy, start, end - start);
        }
    }

    buddy
}

/// Initializes the global physical allocator.
///
/// # Panics
///
/// Panics if the allocator was already initialized, or if it cannot be set up.
///
/// # Safety
///
/// The memory described by `desc` must be valid and unused for the lifetime of the kernel.
pub unsafe fn init(desc: &MemoryDescription<'_>) -> &'static BuddyAllocator {
    if MAIN.get().is_some() {
        panic!("phys: already initialized");
    }

    // SAFETY: guaranteed by the caller
    let buddy = unsafe { build(desc) };
    MAIN.call_once(|| buddy)
}

/// Returns the global physical allocator.
///
/// # Panics
///
/// Panics if the allocator has not been initialized yet.
pub fn allocator() -> &'static BuddyAllocator {
    match MAIN.get() {
        Some(buddy) => buddy,
        None => panic!("phys: not initialized"),
    }
}

/// Allocates `size` bytes of physical memory, returning a null pointer on failure.
pub fn malloc(size: usize) -> *mut u8 {
    allocator()
        .allocate(size)
        .map_or(core::ptr::null_mut(), NonNull::as_ptr)
}

/// Releases physical memory allocated with [`malloc`]. Null pointers are ignored.
///
/// # Safety
///
/// `ptr` must have been returned by [`malloc`] and not released since.
pub unsafe fn free(ptr: *mut u8) {
    if let Some(ptr) = NonNull::new(ptr) {
        // SAFETY: guaranteed by the caller
        unsafe { allocator().release(ptr) };
    }
}

/// Excludes a range of physical memory from allocation.
///
/// # Panics
///
/// Panics if the range overlaps a live allocation.
pub fn reserve(ptr: *mut u8, size: usize) {
    reserve_on(allocator(), ptr as usize, size);
}

/// Makes a range excluded with [`reserve`] available again.
///
/// # Panics
///
/// Panics if any page of the range is not reserved.
pub fn unreserve(ptr: *mut u8, size: usize) {
    if !allocator().unreserve(ptr, size) {
        error!("phys: cannot unreserve {:p}+{:#x}", ptr, size);
        panic!("phys: unreserve failed");
    }
}

fn reserve_on(buddy: &BuddyAllocator, addr: usize, size: usize) {
    if !buddy.reserve(addr as *mut u8, size) {
        error!("phys: cannot reserve {:#x}+{:#x}", addr, size);
        panic!("phys: reserve failed");
    }
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use crate::{boot::ReservedRange, testing};

    use super::*;

    const MIB: usize = 1024 * 1024;

    fn description<'a>(
        base: usize,
        size: usize,
        reserved: Option<&'a ReservedRange<'a>>,
        kernel_image: Range<usize>,
        load_offset: usize,
    ) -> MemoryDescription<'a> {
        MemoryDescription {
            mem_lower: base + PAGE_SIZE,
            mem_upper: base + size,
            reserved,
            kernel_image,
            load_offset,
        }
    }

    #[test]
    fn placement_skips_excluded_ranges() {
        let base = 0x4000_0000;
        let hole = ReservedRange::new(base + 3 * MIB, base + 3 * MIB + 0x1800, None);
        let desc = description(
            base,
            16 * MIB,
            Some(&hole),
            base + MIB..base + 3 * MIB - 10,
            base + MIB,
        );

        // The kernel image, then the reserved hole, are in the way
        assert_eq!(place(&desc, 0x3000), Some(base + 3 * MIB + 0x2000));
    }

    #[test]
    fn placement_wraps_around_once() {
        let base = 0x4000_0000;
        let low = ReservedRange::new(base, base + MIB, None);
        let desc = description(base, 16 * MIB, Some(&low), 0..0, base + 16 * MIB - PAGE_SIZE);

        assert_eq!(place(&desc, 2 * PAGE_SIZE), Some(base + MIB));
    }

    #[test]
    fn placement_starts_at_mem_lower() {
        let desc = description(0x4000_0000, 16 * MIB, None, 0..0, 0x1234);
        assert_eq!(place(&desc, PAGE_SIZE), Some(0x4000_1000));
    }

    #[test]
    fn placement_fails_without_room() {
        let base = 0x4000_0000;
        let all = ReservedRange::new(base, base + 16 * MIB, None);
        let desc = description(base, 16 * MIB, Some(&all), 0..0, base);

        assert_eq!(place(&desc, PAGE_SIZE), None);

        let desc = description(base, 16 * MIB, None, 0..0, base);
        assert_eq!(place(&desc, 32 * MIB), None);
    }

    #[test]
    fn build_reserves_everything_excluded() {
        let memory = testing::leak_memory(8 * MIB);
        let bios = ReservedRange::new(memory, memory + MIB, None);
        let kernel = memory + MIB..memory + 2 * MIB + 100;
        let desc = description(memory, 8 * MIB, Some(&bios), kernel.clone(), kernel.start);

        let buddy = unsafe { build(&desc) };
        let buddy_base = buddy as *const BuddyAllocator as usize;
        let buddy_region = buddy_base..buddy_base + BuddyAllocator::get_size(8 * MIB - PAGE_SIZE);

        assert_eq!(buddy.range(), memory + PAGE_SIZE..memory + 8 * MIB);
        assert_eq!(buddy_base, memory + 2 * MIB + PAGE_SIZE);

        let mut pages = Vec::new();
        while let Some(p) = buddy.allocate(PAGE_SIZE) {
            let page = p.as_ptr() as usize..p.as_ptr() as usize + PAGE_SIZE;
            assert!(!overlaps(&page, &bios.range()));
            assert!(!overlaps(&page, &kernel));
            assert!(!overlaps(&page, &buddy_region));
            pages.push(page.start);
        }

        let reserved_pages = (2 * MIB + PAGE_SIZE) / PAGE_SIZE - 1
            + buddy_region.len().div_ceil(PAGE_SIZE);
        assert_eq!(pages.len(), 8 * MIB / PAGE_SIZE - 1 - reserved_pages);
    }

    #[test]
    fn build_clips_ranges_outside_memory() {
        let memory = testing::leak_memory(4 * MIB);
        let above = ReservedRange::new(memory + 3 * MIB, memory + 64 * MIB, None);
        let desc = description(memory, 4 * MIB, Some(&above), 0..PAGE_SIZE, 0);

        let buddy = unsafe { build(&desc) };
        assert_eq!(buddy as *const BuddyAllocator as usize, memory + PAGE_SIZE);

        let p = buddy.allocate(MIB).unwrap();
        assert!((p.as_ptr() as usize) < memory + 3 * MIB);
    }

    #[test]
    #[should_panic(expected = "no room")]
    fn build_without_room_is_fatal() {
        let memory = testing::leak_memory(MIB);
        let all = ReservedRange::new(memory, memory + MIB, None);
        let desc = description(memory, MIB, Some(&all), 0..0, memory);

        unsafe { build(&desc) };
    }

    #[test]
    fn global_allocator_is_placed_after_the_kernel() {
        let boot = testing::boot();
        let buddy = allocator();

        assert_eq!(buddy.range(), managed_range(&boot.description()));
        assert!(buddy as *const BuddyAllocator as usize >= boot.kernel_image.end);
    }

    #[test]
    fn wrappers() {
        let boot = testing::boot();

        let p = malloc(3 * PAGE_SIZE);
        assert!(!p.is_null());
        assert!((p as usize).is_aligned(PAGE_SIZE));
        for r in boot.description().excluded() {
            assert!(!overlaps(&r, &(p as usize..p as usize + 3 * PAGE_SIZE)));
        }

        unsafe { free(p) };
        unsafe { free(core::ptr::null_mut()) };
        assert!(malloc(0).is_null());
    }

    #[test]
    #[should_panic(expected = "unreserve failed")]
    fn unreserving_free_memory_is_fatal() {
        let _boot = testing::boot();
        let p = malloc(PAGE_SIZE);

        unreserve(p, PAGE_SIZE);
    }

    #[test]
    #[should_panic(expected = "already initialized")]
    fn second_init_is_fatal() {
        let boot = testing::boot();
        unsafe { init(&boot.description()) };
    }
}
