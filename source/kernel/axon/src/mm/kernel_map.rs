// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel identity map and translation enable
//! OWNERS: @kernel-mm-team
//! PUBLIC API: KernelLayout, build_kernel_table(), satp_value(), activate()
//! DEPENDS_ON: mm::page_table, hal::{Paging, Tlb}
//! INVARIANTS: VA == PA for every kernel mapping; text is RX, everything else RW; never W+X

use core::ops::Range;

use super::frame::FrameAllocator;
use super::page_table::{MapError, PageFlags, PageTable};
use super::{align_down, align_up, PAGE_SIZE};
use crate::config::{PHYSTOP, STACK_WINDOW_BASE, UART0_BASE};
use crate::hal::{Paging, Tlb};
use crate::types::{PhysAddr, Ppn, VirtAddr};

const MODE_SV39: usize = 8;

/// Physical layout of the running kernel image and RAM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelLayout {
    /// Kernel code.
    pub text: Range<usize>,
    /// Read-only data, data and bss.
    pub data: Range<usize>,
    /// Pages handed to the frame allocator.
    pub pool: Range<usize>,
    /// Reserved top-of-memory window holding the boot stack.
    pub stack: Range<usize>,
    /// UART MMIO page.
    pub uart: usize,
}

impl KernelLayout {
    /// Layout of the linked image, read from linker-provided symbols.
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    pub fn from_linker() -> Self {
        extern "C" {
            static __text_start: u8;
            static __text_end: u8;
            static __kernel_end: u8;
        }
        // SAFETY: only the addresses of the linker symbols are taken.
        let (text_start, text_end, kernel_end) = unsafe {
            (
                core::ptr::addr_of!(__text_start) as usize,
                core::ptr::addr_of!(__text_end) as usize,
                core::ptr::addr_of!(__kernel_end) as usize,
            )
        };
        Self::new(text_start, text_end, kernel_end)
    }

    /// Layout for an image whose code spans `[text_start, text_end)` and
    /// whose static data ends at `kernel_end`.
    pub fn new(text_start: usize, text_end: usize, kernel_end: usize) -> Self {
        let text = align_down(text_start)..align_up(text_end);
        let data = text.end..align_up(kernel_end);
        Self {
            pool: data.end..STACK_WINDOW_BASE,
            text,
            data,
            stack: STACK_WINDOW_BASE..PHYSTOP,
            uart: UART0_BASE,
        }
    }
}

/// Maps every page of `range` to itself. Returns the number of pages mapped.
///
/// Kernel mappings are never both writable and executable.
pub fn map_identity_range(
    table: &mut PageTable,
    frames: &mut FrameAllocator,
    range: Range<usize>,
    flags: PageFlags,
) -> Result<usize, MapError> {
    if flags.contains(PageFlags::WRITE | PageFlags::EXECUTE) {
        return Err(MapError::PermissionDenied);
    }
    let mut mapped = 0;
    let mut addr = align_down(range.start);
    while addr < range.end {
        table.map_page(frames, VirtAddr::new(addr), PhysAddr::new(addr), flags)?;
        mapped += 1;
        addr = addr.checked_add(PAGE_SIZE).ok_or(MapError::OutOfRange)?;
    }
    Ok(mapped)
}

/// Builds the kernel's identity page table.
pub fn build_kernel_table(
    frames: &mut FrameAllocator,
    layout: &KernelLayout,
) -> Result<PageTable, MapError> {
    // A and D are preset; harts without hardware A/D updates fault otherwise.
    let touched = PageFlags::GLOBAL | PageFlags::ACCESSED;
    let rx = PageFlags::READ | PageFlags::EXECUTE | touched;
    let rw = PageFlags::READ | PageFlags::WRITE | PageFlags::DIRTY | touched;

    let mut table = PageTable::create(frames)?;
    let segments = [
        ("text", layout.text.clone(), rx),
        ("data", layout.data.clone(), rw),
        ("pool", layout.pool.clone(), rw),
        ("stack", layout.stack.clone(), rw),
        ("uart", layout.uart..layout.uart + PAGE_SIZE, rw),
    ];
    for (name, range, flags) in segments {
        match map_identity_range(&mut table, frames, range.clone(), flags) {
            Ok(pages) => {
                log_debug!(target: "mm", "kvm: {} [{:#x}, {:#x}) {} pages", name, range.start, range.end, pages);
            }
            Err(err) => {
                log_error!(target: "mm", "kvm: mapping {} failed: {:?}", name, err);
                table.destroy(frames);
                return Err(err);
            }
        }
    }
    Ok(table)
}

/// SATP value selecting Sv39 with ASID 0 and root `root`.
#[inline]
pub const fn satp_value(root: Ppn) -> usize {
    (MODE_SV39 << 60) | root.raw()
}

/// Enables translation through `table` and flushes all cached translations.
pub fn activate<P: Paging + ?Sized, T: Tlb + ?Sized>(table: &PageTable, paging: &P, tlb: &T) {
    let satp = satp_value(table.root());
    paging.write_satp(satp);
    tlb.flush_all();
    log_info!(target: "mm", "paging: satp={:#x}", satp);
}
