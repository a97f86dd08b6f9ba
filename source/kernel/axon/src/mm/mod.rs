// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Memory management: physical pages, Sv39 page tables, kernel map
//! OWNERS: @kernel-mm-team
//! PUBLIC API: FrameAllocator, PageTable, PageFlags, MapError, KernelLayout, build_kernel_table()
//! DEPENDS_ON: hal::{Paging, Tlb}, bitflags
//! INVARIANTS: Every page has exactly one owner; table nodes come only from the FrameAllocator

pub mod frame;
pub mod kernel_map;
pub mod page_table;

pub use frame::{AllocError, FrameAllocator, FreeError};
pub use kernel_map::{activate, build_kernel_table, satp_value, KernelLayout};
pub use page_table::{Mapping, MapError, PageFlags, PageTable, VerifyError};

/// Size of a single page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// log2(PAGE_SIZE).
pub const PAGE_SHIFT: usize = 12;

#[inline]
pub const fn align_down(value: usize) -> usize {
    value & !(PAGE_SIZE - 1)
}

#[inline]
pub const fn align_up(value: usize) -> usize {
    (value + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}
