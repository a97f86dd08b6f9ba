// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical page allocator (intrusive LIFO free list)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: FrameAllocator::{init, alloc_page, alloc_zeroed, free_page, free_pages, contains}
//! DEPENDS_ON: types::{PhysAddr, Ppn}
//! INVARIANTS: Free pages are page aligned and inside the managed range; the first word of a
//!             free page links to the next one; lowest address is handed out first after init

use core::ops::Range;
use core::ptr::NonNull;

use super::page_table::PageTableNode;
use super::{align_down, align_up, PAGE_SIZE};
use crate::types::{PhysAddr, Ppn};

/// Allocation failure.
#[must_use = "allocation errors must be handled"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The free list is empty.
    OutOfMemory,
}

/// Rejected `free_page` request. The page was not linked into the pool.
#[must_use = "free errors indicate a caller bug"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeError {
    Unaligned(PhysAddr),
    OutOfRange(PhysAddr),
}

#[repr(C)]
struct FreePage {
    next: Option<NonNull<FreePage>>,
}

/// Pool of 4 KiB physical pages carved from one contiguous range.
pub struct FrameAllocator {
    head: Option<NonNull<FreePage>>,
    start: usize,
    end: usize,
    free: usize,
}

impl FrameAllocator {
    /// Allocator managing no memory.
    pub const fn empty() -> Self {
        Self { head: None, start: 0, end: 0, free: 0 }
    }

    /// Threads every page of `[start, end)` into the free list.
    ///
    /// `start` is rounded up and `end` rounded down to page boundaries.
    /// Pages are prepended from the top down so the lowest address is
    /// allocated first.
    ///
    /// # Safety
    ///
    /// The range must be unused RAM, addressable at its physical address and
    /// owned exclusively by this allocator from now on.
    pub unsafe fn init(&mut self, start: usize, end: usize) {
        let start = align_up(start);
        let end = align_down(end).max(start);
        self.head = None;
        self.start = start;
        self.end = end;
        self.free = 0;

        let mut page = end;
        while page > start {
            page -= PAGE_SIZE;
            // SAFETY: `page` lies in the range handed over by the caller.
            unsafe { self.push(page) };
        }
        log_info!(target: "mm", "frames: {} pages in [{:#x}, {:#x})", self.free, start, end);
    }

    /// # Safety
    ///
    /// `addr` is a free, page-aligned page inside the managed range.
    unsafe fn push(&mut self, addr: usize) {
        let node = addr as *mut FreePage;
        // SAFETY: the page is owned by the pool and large enough for the link word.
        unsafe { node.write(FreePage { next: self.head }) };
        self.head = NonNull::new(node);
        self.free += 1;
    }

    /// Pops the head of the free list.
    pub fn alloc_page(&mut self) -> Result<PhysAddr, AllocError> {
        let Some(node) = self.head else {
            log_warn!(target: "mm", "alloc_page: out of memory");
            return Err(AllocError::OutOfMemory);
        };
        // SAFETY: list nodes are free pages initialised by `push`.
        self.head = unsafe { node.as_ref().next };
        self.free -= 1;
        Ok(PhysAddr::new(node.as_ptr() as usize))
    }

    /// Allocates a page and fills it with zeroes.
    pub fn alloc_zeroed(&mut self) -> Result<PhysAddr, AllocError> {
        let pa = self.alloc_page()?;
        // SAFETY: the page was just removed from the pool and belongs to the caller.
        unsafe { core::ptr::write_bytes(pa.as_mut_ptr::<u8>(), 0, PAGE_SIZE) };
        Ok(pa)
    }

    /// Returns `pa` to the pool.
    ///
    /// Misaligned or out-of-range addresses are logged and ignored.
    ///
    /// # Safety
    ///
    /// `pa` must have come from this allocator and must no longer be used
    /// by its previous owner.
    pub unsafe fn free_page(&mut self, pa: PhysAddr) -> Result<(), FreeError> {
        if !pa.is_page_aligned() {
            log_error!(target: "mm", "free_page: unaligned {:#x}", pa);
            return Err(FreeError::Unaligned(pa));
        }
        if !self.contains(pa) {
            log_error!(target: "mm", "free_page: {:#x} outside managed range", pa);
            return Err(FreeError::OutOfRange(pa));
        }
        // SAFETY: validated above; ownership transfer guaranteed by the caller.
        unsafe { self.push(pa.raw()) };
        Ok(())
    }

    /// Number of pages currently in the pool.
    pub fn free_pages(&self) -> usize {
        self.free
    }

    /// Total number of pages managed.
    pub fn total_pages(&self) -> usize {
        (self.end - self.start) / PAGE_SIZE
    }

    pub fn managed_range(&self) -> Range<usize> {
        self.start..self.end
    }

    pub fn contains(&self, pa: PhysAddr) -> bool {
        (self.start..self.end).contains(&pa.raw())
    }

    /// Arena accessor: the page-table node stored in frame `ppn`.
    ///
    /// Returns `None` for frames the allocator does not manage, so a
    /// corrupted interior entry cannot send a walk outside the pool.
    pub(crate) fn table_node(&self, ppn: Ppn) -> Option<NonNull<PageTableNode>> {
        let pa = ppn.addr();
        if !self.contains(pa) {
            return None;
        }
        NonNull::new(pa.as_mut_ptr::<PageTableNode>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::testing::Arena;
    use proptest::prelude::*;

    #[test]
    fn hands_out_lowest_address_first() {
        let arena = Arena::new(4);
        let mut frames = arena.allocator();
        assert_eq!(frames.free_pages(), 4);
        let first = frames.alloc_page().expect("page");
        let second = frames.alloc_page().expect("page");
        assert_eq!(first.raw(), arena.start());
        assert_eq!(second.raw(), arena.start() + PAGE_SIZE);
    }

    #[test]
    fn reports_exhaustion() {
        let arena = Arena::new(2);
        let mut frames = arena.allocator();
        frames.alloc_page().expect("page");
        frames.alloc_page().expect("page");
        assert_eq!(frames.alloc_page(), Err(AllocError::OutOfMemory));
        assert_eq!(frames.free_pages(), 0);
    }

    #[test]
    fn freed_page_is_reused_first() {
        let arena = Arena::new(3);
        let mut frames = arena.allocator();
        let a = frames.alloc_page().expect("page");
        let _b = frames.alloc_page().expect("page");
        unsafe { frames.free_page(a) }.expect("free");
        assert_eq!(frames.alloc_page(), Ok(a));
    }

    #[test]
    fn rejects_unaligned_free_without_linking() {
        let arena = Arena::new(2);
        let mut frames = arena.allocator();
        let page = frames.alloc_page().expect("page");
        let bogus = PhysAddr::new(page.raw() + 8);
        assert_eq!(unsafe { frames.free_page(bogus) }, Err(FreeError::Unaligned(bogus)));
        assert_eq!(frames.free_pages(), 1);
    }

    #[test]
    fn rejects_free_below_managed_range() {
        let arena = Arena::new(2);
        let mut frames = arena.allocator();
        let below = PhysAddr::new(arena.start() - PAGE_SIZE);
        assert_eq!(unsafe { frames.free_page(below) }, Err(FreeError::OutOfRange(below)));
        let above = PhysAddr::new(arena.end());
        assert_eq!(unsafe { frames.free_page(above) }, Err(FreeError::OutOfRange(above)));
        assert_eq!(frames.free_pages(), 2);
    }

    #[test]
    fn zeroed_allocation_clears_stale_bytes() {
        let arena = Arena::new(1);
        let mut frames = arena.allocator();
        let page = frames.alloc_page().expect("page");
        unsafe { core::ptr::write_bytes(page.as_mut_ptr::<u8>(), 0xa5, PAGE_SIZE) };
        unsafe { frames.free_page(page) }.expect("free");
        let page = frames.alloc_zeroed().expect("page");
        let bytes = unsafe { core::slice::from_raw_parts(page.as_mut_ptr::<u8>(), PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn init_rounds_range_to_pages() {
        let arena = Arena::new(4);
        let mut frames = FrameAllocator::empty();
        unsafe { frames.init(arena.start() + 1, arena.end() - 1) };
        assert_eq!(frames.total_pages(), 2);
        assert_eq!(frames.managed_range(), arena.start() + PAGE_SIZE..arena.end() - PAGE_SIZE);
    }

    #[test]
    fn table_node_refuses_foreign_frames() {
        let arena = Arena::new(1);
        let frames = arena.allocator();
        assert!(frames.table_node(PhysAddr::new(arena.start()).ppn()).is_some());
        assert!(frames.table_node(PhysAddr::new(arena.end()).ppn()).is_none());
    }

    proptest! {
        #[test]
        fn allocation_conserves_pages(count in 1usize..=16) {
            let arena = Arena::new(16);
            let mut frames = arena.allocator();
            let mut pages = Vec::new();
            for _ in 0..count {
                let pa = frames.alloc_page().expect("page");
                prop_assert!(pa.is_page_aligned());
                prop_assert!(frames.managed_range().contains(&pa.raw()));
                pages.push(pa);
            }
            for pa in pages.drain(..) {
                unsafe { frames.free_page(pa) }.expect("free");
            }
            prop_assert_eq!(frames.free_pages(), 16);
            for _ in 0..count {
                pages.push(frames.alloc_page().expect("page after free"));
            }
            pages.sort();
            pages.dedup();
            prop_assert_eq!(pages.len(), count);
        }
    }
}
