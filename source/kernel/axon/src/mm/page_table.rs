// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sv39 page-table implementation with lazy allocation of intermediate levels.
//!
//! Table nodes live in frames owned by the [`FrameAllocator`] and are only
//! reached through [`FrameAllocator::table_node`], which bounds-checks the
//! page-frame number stored in an interior entry. An entry that is valid but
//! carries no R/W/X bit is interior; any R/W/X bit makes it a leaf.

use core::ptr::NonNull;

use bitflags::bitflags;

use super::frame::{AllocError, FrameAllocator};
use super::{PAGE_SHIFT, PAGE_SIZE};
use crate::types::{PhysAddr, Ppn, VirtAddr};

/// Number of entries per Sv39 page-table page.
pub const PT_ENTRIES: usize = 512;
/// Levels of the radix tree (2 = root, 0 = leaf level).
const LEVELS: usize = 3;
const VPN_BITS: usize = 9;
const VPN_MASK: usize = PT_ENTRIES - 1;
const PTE_PPN_SHIFT: usize = 10;
const PTE_PPN_MASK: usize = (1 << 44) - 1;
const PTE_FLAG_MASK: usize = 0xff;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Flags stored in Sv39 page-table entries.
    pub struct PageFlags: usize {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
    }
}

const LEAF_PERMS: PageFlags = PageFlags::READ.union(PageFlags::WRITE).union(PageFlags::EXECUTE);

/// Error returned when manipulating page tables.
#[must_use = "map errors must be handled"]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// Virtual or physical address was not page aligned.
    Unaligned,
    /// Virtual address is not canonical for Sv39.
    OutOfRange,
    /// Kernel mapping requested both W and X.
    PermissionDenied,
    /// The leaf slot (or a superpage above it) is already valid.
    Overlap,
    /// Flags do not describe a valid leaf entry.
    InvalidFlags,
    /// An intermediate level is missing and allocation was not allowed.
    NotFound,
    /// No page was available for an intermediate node.
    OutOfMemory,
}

impl From<AllocError> for MapError {
    fn from(_: AllocError) -> Self {
        MapError::OutOfMemory
    }
}

/// Structural defect found by [`PageTable::verify`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyError {
    /// A level-0 entry is valid but grants no access.
    EmptyLeaf { va: VirtAddr },
    /// An interior entry points outside the frame arena.
    ForeignNode { va: VirtAddr, level: usize },
}

/// One Sv39 page-table entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(usize);

impl Pte {
    #[inline]
    fn new(ppn: Ppn, flags: PageFlags) -> Self {
        Self((ppn.raw() << PTE_PPN_SHIFT) | flags.bits())
    }

    #[inline]
    pub fn bits(self) -> usize {
        self.0
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 & PageFlags::VALID.bits() != 0
    }

    /// Valid with at least one of R/W/X.
    #[inline]
    pub fn is_leaf(self) -> bool {
        self.is_valid() && self.0 & LEAF_PERMS.bits() != 0
    }

    /// Valid with none of R/W/X: points to a child node.
    #[inline]
    pub fn is_interior(self) -> bool {
        self.is_valid() && self.0 & LEAF_PERMS.bits() == 0
    }

    #[inline]
    pub fn ppn(self) -> Ppn {
        Ppn::from_raw((self.0 >> PTE_PPN_SHIFT) & PTE_PPN_MASK)
    }

    #[inline]
    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & PTE_FLAG_MASK)
    }
}

/// A 4 KiB page-table node.
#[repr(C, align(4096))]
pub struct PageTableNode {
    entries: [Pte; PT_ENTRIES],
}

static_assertions::const_assert_eq!(core::mem::size_of::<PageTableNode>(), PAGE_SIZE);

/// Result of a successful lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub pa: PhysAddr,
    /// Permission bits of the leaf, without `VALID`.
    pub flags: PageFlags,
}

/// Three-level Sv39 page table identified by its root frame.
///
/// The table does not free itself on drop; call [`PageTable::destroy`]
/// with the allocator that owns its nodes.
#[derive(Debug)]
pub struct PageTable {
    root: Ppn,
}

impl PageTable {
    /// Allocates a zero-filled root node.
    pub fn create(frames: &mut FrameAllocator) -> Result<Self, MapError> {
        let root = frames.alloc_zeroed()?;
        Ok(Self { root: root.ppn() })
    }

    /// Physical page number of the root node, suitable for SATP.
    pub fn root(&self) -> Ppn {
        self.root
    }

    /// Returns the level-0 slot for `va`.
    ///
    /// Missing intermediate nodes are allocated and zero-filled when
    /// `allow_alloc` is set and installed as interior entries (valid bit
    /// only); otherwise the walk fails with [`MapError::NotFound`].
    pub fn walk<'a>(
        &'a mut self,
        frames: &'a mut FrameAllocator,
        va: VirtAddr,
        allow_alloc: bool,
    ) -> Result<&'a mut Pte, MapError> {
        if !is_canonical_sv39(va.raw()) {
            return Err(MapError::OutOfRange);
        }
        let mut node = node_ptr(frames, self.root)?;
        for level in (1..LEVELS).rev() {
            // SAFETY: `node` is an arena frame owned by this table; no other
            // reference to it is live during the walk.
            let slot = unsafe { &mut (*node.as_ptr()).entries[vpn(va.raw(), level)] };
            if slot.is_leaf() {
                return Err(MapError::Overlap);
            }
            if slot.is_interior() {
                node = node_ptr(frames, slot.ppn())?;
                continue;
            }
            if !allow_alloc {
                return Err(MapError::NotFound);
            }
            let child = frames.alloc_zeroed()?;
            *slot = Pte::new(child.ppn(), PageFlags::VALID);
            node = node_ptr(frames, child.ppn())?;
        }
        // SAFETY: as above; the returned borrow is tied to `self` and `frames`.
        Ok(unsafe { &mut (*node.as_ptr()).entries[vpn(va.raw(), 0)] })
    }

    /// Installs a 4 KiB mapping from `va` to `pa` with permissions `perm`.
    ///
    /// Rejected requests are logged and leave the table unchanged, apart
    /// from intermediate nodes a successful walk may already have added.
    pub fn map_page(
        &mut self,
        frames: &mut FrameAllocator,
        va: VirtAddr,
        pa: PhysAddr,
        perm: PageFlags,
    ) -> Result<(), MapError> {
        self.try_map(frames, va, pa, perm).map_err(|err| {
            log_warn!(target: "mm", "map_page {:#x} -> {:#x} rejected: {:?}", va, pa, err);
            err
        })
    }

    fn try_map(
        &mut self,
        frames: &mut FrameAllocator,
        va: VirtAddr,
        pa: PhysAddr,
        perm: PageFlags,
    ) -> Result<(), MapError> {
        if !va.is_page_aligned() || !pa.is_page_aligned() {
            return Err(MapError::Unaligned);
        }
        if !is_canonical_sv39(va.raw()) {
            return Err(MapError::OutOfRange);
        }
        if perm.intersection(LEAF_PERMS).is_empty() {
            return Err(MapError::InvalidFlags);
        }
        let slot = self.walk(frames, va, true)?;
        if slot.is_valid() {
            return Err(MapError::Overlap);
        }
        *slot = Pte::new(pa.ppn(), perm | PageFlags::VALID);
        Ok(())
    }

    /// Reports the leaf mapping for `va`, if any.
    pub fn lookup(&self, frames: &FrameAllocator, va: VirtAddr) -> Option<Mapping> {
        if !is_canonical_sv39(va.raw()) {
            return None;
        }
        let mut node = frames.table_node(self.root)?;
        for level in (0..LEVELS).rev() {
            // SAFETY: read-only access to an arena frame of this table.
            let entry = unsafe { (*node.as_ptr()).entries[vpn(va.raw(), level)] };
            if level == 0 {
                return entry.is_leaf().then(|| Mapping {
                    pa: entry.ppn().addr(),
                    flags: entry.flags().difference(PageFlags::VALID),
                });
            }
            if !entry.is_interior() {
                return None;
            }
            node = frames.table_node(entry.ppn())?;
        }
        None
    }

    /// Frees every node of the tree, children before parents.
    ///
    /// Only interior entries are followed; pages referenced by leaves are
    /// left to their owners. Returns the number of node pages released.
    pub fn destroy(self, frames: &mut FrameAllocator) -> usize {
        free_subtree(frames, self.root, LEVELS - 1)
    }

    /// Checks structural invariants and returns the number of nodes visited.
    pub fn verify(&self, frames: &FrameAllocator) -> Result<usize, VerifyError> {
        verify_subtree(frames, self.root, LEVELS - 1, 0)
    }

    /// Calls `f` for every leaf mapping in ascending virtual-address order.
    pub fn for_each_leaf(&self, frames: &FrameAllocator, f: &mut dyn FnMut(VirtAddr, Mapping)) {
        visit_leaves(frames, self.root, LEVELS - 1, 0, f);
    }

    /// Logs every leaf mapping at debug level.
    pub fn dump(&self, frames: &FrameAllocator) {
        log_debug!(target: "mm", "page table root ppn={:#x}", self.root.raw());
        self.for_each_leaf(frames, &mut |va, m| {
            log_debug!(target: "mm", "  {:#011x} -> {:#011x} {:?}", va, m.pa, m.flags);
        });
    }
}

fn node_ptr(frames: &FrameAllocator, ppn: Ppn) -> Result<NonNull<PageTableNode>, MapError> {
    frames.table_node(ppn).ok_or_else(|| {
        log_error!(target: "mm", "page table node {:#x} outside frame arena", ppn.raw());
        MapError::NotFound
    })
}

fn free_subtree(frames: &mut FrameAllocator, ppn: Ppn, level: usize) -> usize {
    let Some(node) = frames.table_node(ppn) else {
        log_error!(target: "mm", "destroy: node {:#x} outside frame arena", ppn.raw());
        return 0;
    };
    let mut freed = 0;
    if level > 0 {
        for index in 0..PT_ENTRIES {
            // SAFETY: the node is owned by the table being destroyed.
            let entry = unsafe { (*node.as_ptr()).entries[index] };
            if entry.is_interior() {
                freed += free_subtree(frames, entry.ppn(), level - 1);
            }
        }
    }
    // SAFETY: every child has been released; nothing references this node any more.
    if unsafe { frames.free_page(ppn.addr()) }.is_ok() {
        freed += 1;
    }
    freed
}

fn verify_subtree(
    frames: &FrameAllocator,
    ppn: Ppn,
    level: usize,
    va_prefix: usize,
) -> Result<usize, VerifyError> {
    let node = frames
        .table_node(ppn)
        .ok_or(VerifyError::ForeignNode { va: VirtAddr::new(va_prefix), level })?;
    let mut visited = 1;
    for index in 0..PT_ENTRIES {
        // SAFETY: read-only access to an arena frame of this table.
        let entry = unsafe { (*node.as_ptr()).entries[index] };
        let va = va_prefix | (index << (PAGE_SHIFT + VPN_BITS * level));
        if !entry.is_interior() {
            continue;
        }
        if level == 0 {
            return Err(VerifyError::EmptyLeaf { va: VirtAddr::new(sign_extend(va)) });
        }
        visited += verify_subtree(frames, entry.ppn(), level - 1, va)?;
    }
    Ok(visited)
}

fn visit_leaves(
    frames: &FrameAllocator,
    ppn: Ppn,
    level: usize,
    va_prefix: usize,
    f: &mut dyn FnMut(VirtAddr, Mapping),
) {
    let Some(node) = frames.table_node(ppn) else {
        return;
    };
    for index in 0..PT_ENTRIES {
        // SAFETY: read-only access to an arena frame of this table.
        let entry = unsafe { (*node.as_ptr()).entries[index] };
        let va = va_prefix | (index << (PAGE_SHIFT + VPN_BITS * level));
        if entry.is_leaf() {
            let mapping =
                Mapping { pa: entry.ppn().addr(), flags: entry.flags().difference(PageFlags::VALID) };
            f(VirtAddr::new(sign_extend(va)), mapping);
        } else if entry.is_interior() && level > 0 {
            visit_leaves(frames, entry.ppn(), level - 1, va, f);
        }
    }
}

#[inline]
fn vpn(va: usize, level: usize) -> usize {
    (va >> (PAGE_SHIFT + VPN_BITS * level)) & VPN_MASK
}

/// Extends bit 38 into the upper bits, as Sv39 requires.
#[inline]
fn sign_extend(va: usize) -> usize {
    if va & (1 << 38) != 0 {
        va | !((1 << 39) - 1)
    } else {
        va
    }
}

pub fn is_canonical_sv39(va: usize) -> bool {
    let sign = (va >> 38) & 1;
    let upper = va >> 39;
    if sign == 0 {
        upper == 0
    } else {
        upper == usize::MAX >> 39
    }
}
