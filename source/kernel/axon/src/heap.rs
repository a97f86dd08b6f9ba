// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel heap over a static arena
//! OWNERS: @kernel-mm-team
//! PUBLIC API: init_heap(), stats()
//! DEPENDS_ON: linked_list_allocator::Heap, spin::Mutex
//! INVARIANTS: Initialised once before the first allocation; the arena never moves
//!
//! The heap is independent of the page allocator: file data is its only
//! client, so a fixed arena in `.bss` keeps the frame pool intact.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, Ordering};

use linked_list_allocator::Heap;
use spin::Mutex;

use crate::config::HEAP_SIZE;

#[repr(C, align(4096))]
struct Arena([u8; HEAP_SIZE]);

static mut HEAP_ARENA: Arena = Arena([0; HEAP_SIZE]);
static HEAP_READY: AtomicBool = AtomicBool::new(false);

/// First-fit heap behind a spin lock.
pub struct KernelHeap(Mutex<Heap>);

impl KernelHeap {
    pub const fn empty() -> Self {
        Self(Mutex::new(Heap::empty()))
    }

    /// # Safety
    ///
    /// `[bottom, bottom + size)` must be unused writable memory that outlives the heap.
    pub unsafe fn init(&self, bottom: *mut u8, size: usize) {
        // SAFETY: forwarded caller contract.
        unsafe { self.0.lock().init(bottom, size) };
    }

    /// Bytes in use and bytes free.
    pub fn stats(&self) -> (usize, usize) {
        let heap = self.0.lock();
        (heap.used(), heap.free())
    }
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.0.lock().allocate_first_fit(layout).map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            // SAFETY: `ptr` came from `alloc` with the same layout.
            unsafe { self.0.lock().deallocate(ptr, layout) };
        }
    }
}

#[cfg_attr(not(test), global_allocator)]
static ALLOCATOR: KernelHeap = KernelHeap::empty();

/// Hands the static arena to the global allocator. Later calls are no-ops.
pub fn init_heap() {
    if HEAP_READY.swap(true, Ordering::AcqRel) {
        return;
    }
    // SAFETY: first and only initialisation; the arena is reserved for the heap.
    unsafe {
        let bottom = ptr::addr_of_mut!(HEAP_ARENA) as *mut u8;
        ALLOCATOR.init(bottom, HEAP_SIZE);
    }
    log_info!(target: "heap", "heap: {} KiB", HEAP_SIZE / 1024);
}

/// Usage of the global kernel heap.
pub fn stats() -> (usize, usize) {
    ALLOCATOR.stats()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::testing::Arena as Pages;

    #[test]
    fn allocations_come_from_the_arena_and_return() {
        let pages = Pages::new(4);
        let heap = KernelHeap::empty();
        unsafe { heap.init(pages.start() as *mut u8, pages.end() - pages.start()) };

        let layout = Layout::from_size_align(256, 16).expect("layout");
        let a = unsafe { heap.alloc(layout) };
        let b = unsafe { heap.alloc(layout) };
        assert!(!a.is_null() && !b.is_null());
        assert_ne!(a, b);
        for p in [a, b] {
            assert!((pages.start()..pages.end()).contains(&(p as usize)));
            assert_eq!(p as usize % 16, 0);
        }
        assert!(heap.stats().0 >= 512);

        unsafe {
            heap.dealloc(a, layout);
            heap.dealloc(b, layout);
        }
        assert_eq!(heap.stats().0, 0);
    }

    #[test]
    fn exhaustion_returns_null() {
        let pages = Pages::new(1);
        let heap = KernelHeap::empty();
        unsafe { heap.init(pages.start() as *mut u8, pages.end() - pages.start()) };
        let layout = Layout::from_size_align(2 * 4096, 8).expect("layout");
        assert!(unsafe { heap.alloc(layout) }.is_null());
    }
}
