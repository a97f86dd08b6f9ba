// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Flat RAM file store backing the file syscalls
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (round trip, limits, unlink while open)
//! PUBLIC API: FileStore, OpenFlags, Fd, FsError
//! DEPENDS_ON: alloc::vec::Vec (kernel heap)
//! INVARIANTS: One directory (the root, inode 1); file inodes are numbered from 2;
//!             descriptors are numbered from FIRST_FD; a descriptor on an unlinked file
//!             never reattaches to a later file
//!
//! Paths have the form `/name`. File data lives in the kernel heap and is
//! lost at reboot.

use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;

/// File inode capacity; the root directory is not counted.
pub const MAX_INODES: usize = 50;
/// Inode number of the root directory.
pub const ROOT_INO: u32 = 1;
/// Longest accepted file name in bytes.
pub const MAX_NAME: usize = 28;
/// Largest file size in bytes.
pub const MAX_FILE_SIZE: usize = 64 * 1024;
/// Open descriptor capacity.
pub const MAX_OPEN: usize = 16;
/// Lowest descriptor number handed out; 0..=2 are console streams.
pub const FIRST_FD: usize = 3;

bitflags! {
    /// Flags accepted by [`FileStore::open`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Create the file; fails if it already exists.
        const CREATE = 1 << 0;
    }
}

/// File descriptor number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Fd(usize);

impl Fd {
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> usize {
        self.0
    }

    fn slot(self) -> Option<usize> {
        self.0.checked_sub(FIRST_FD).filter(|&i| i < MAX_OPEN)
    }
}

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[must_use = "file store errors must be handled"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Path is not of the form `/name`.
    InvalidPath,
    NameTooLong,
    NotFound,
    AlreadyExists,
    /// Every inode is in use.
    NoInodes,
    /// Every descriptor is in use.
    TooManyOpen,
    /// Descriptor is closed, out of range, or refers to an unlinked file.
    BadDescriptor,
    FileTooLarge,
    OutOfMemory,
}

struct Inode {
    name: [u8; MAX_NAME],
    name_len: usize,
    data: Vec<u8>,
}

impl Inode {
    fn name(&self) -> &[u8] {
        &self.name[..self.name_len]
    }
}

#[derive(Clone, Copy)]
struct OpenFile {
    /// `None` once the file has been unlinked.
    ino: Option<u32>,
    offset: usize,
}

/// The file store. Inode `n` lives at `inodes[n - 2]`.
pub struct FileStore {
    inodes: [Option<Inode>; MAX_INODES],
    open: [Option<OpenFile>; MAX_OPEN],
}

impl FileStore {
    pub fn new() -> Self {
        Self { inodes: core::array::from_fn(|_| None), open: [None; MAX_OPEN] }
    }

    /// Opens `/name`, creating it when `flags` contains [`OpenFlags::CREATE`].
    ///
    /// Creating an existing file and opening a missing one both fail. The
    /// descriptor starts at offset 0.
    pub fn open(&mut self, path: &[u8], flags: OpenFlags) -> Result<Fd, FsError> {
        let name = parse_path(path)?;
        let slot = self.open.iter().position(Option::is_none).ok_or(FsError::TooManyOpen)?;
        let ino = match (self.find(name), flags.contains(OpenFlags::CREATE)) {
            (Some(_), true) => return Err(FsError::AlreadyExists),
            (None, false) => return Err(FsError::NotFound),
            (Some(ino), false) => ino,
            (None, true) => self.create(name)?,
        };
        self.open[slot] = Some(OpenFile { ino: Some(ino), offset: 0 });
        let fd = Fd(slot + FIRST_FD);
        log_debug!(target: "fs", "open {:?} -> fd {} (ino {})", Name(name), fd, ino);
        Ok(fd)
    }

    /// Releases `fd`. Descriptors on unlinked files close normally.
    pub fn close(&mut self, fd: Fd) -> Result<(), FsError> {
        let slot = fd.slot().ok_or(FsError::BadDescriptor)?;
        self.open[slot].take().map(|_| ()).ok_or(FsError::BadDescriptor)
    }

    /// Reads up to `buf.len()` bytes at the descriptor offset. Returns 0 at end of file.
    pub fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Result<usize, FsError> {
        let (slot, ino) = self.live(fd)?;
        let offset = self.open[slot].map_or(0, |f| f.offset);
        let data = &self.inode(ino).ok_or(FsError::BadDescriptor)?.data;
        let n = data.len().saturating_sub(offset).min(buf.len());
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        if let Some(file) = self.open[slot].as_mut() {
            file.offset += n;
        }
        Ok(n)
    }

    /// Writes `buf` at the descriptor offset, growing the file as needed.
    pub fn write(&mut self, fd: Fd, buf: &[u8]) -> Result<usize, FsError> {
        let (slot, ino) = self.live(fd)?;
        let offset = self.open[slot].map_or(0, |f| f.offset);
        let end = offset.checked_add(buf.len()).ok_or(FsError::FileTooLarge)?;
        if end > MAX_FILE_SIZE {
            return Err(FsError::FileTooLarge);
        }
        let data = &mut self.inode_mut(ino).ok_or(FsError::BadDescriptor)?.data;
        if end > data.len() {
            data.try_reserve(end - data.len()).map_err(|_| FsError::OutOfMemory)?;
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        if let Some(file) = self.open[slot].as_mut() {
            file.offset = end;
        }
        Ok(buf.len())
    }

    /// Removes the file record. Open descriptors on it become stale.
    pub fn unlink(&mut self, path: &[u8]) -> Result<(), FsError> {
        let name = parse_path(path)?;
        let ino = self.find(name).ok_or(FsError::NotFound)?;
        if let Some(entry) = slot_of(ino).and_then(|i| self.inodes.get_mut(i)) {
            *entry = None;
        }
        for file in self.open.iter_mut().flatten().filter(|f| f.ino == Some(ino)) {
            file.ino = None;
        }
        log_debug!(target: "fs", "unlink {:?} (ino {})", Name(name), ino);
        Ok(())
    }

    /// Size of `/name` in bytes.
    pub fn size(&self, path: &[u8]) -> Result<usize, FsError> {
        let ino = self.find(parse_path(path)?).ok_or(FsError::NotFound)?;
        self.inode(ino).map(|i| i.data.len()).ok_or(FsError::NotFound)
    }

    pub fn exists(&self, path: &[u8]) -> bool {
        parse_path(path).ok().and_then(|name| self.find(name)).is_some()
    }

    /// Number of files, excluding the root directory.
    pub fn file_count(&self) -> usize {
        self.inodes.iter().flatten().count()
    }

    pub fn open_count(&self) -> usize {
        self.open.iter().flatten().count()
    }

    fn find(&self, name: &[u8]) -> Option<u32> {
        self.inodes
            .iter()
            .position(|i| i.as_ref().is_some_and(|i| i.name() == name))
            .map(ino_of)
    }

    fn create(&mut self, name: &[u8]) -> Result<u32, FsError> {
        let index = self.inodes.iter().position(Option::is_none).ok_or(FsError::NoInodes)?;
        let mut stored = [0u8; MAX_NAME];
        stored[..name.len()].copy_from_slice(name);
        self.inodes[index] = Some(Inode { name: stored, name_len: name.len(), data: Vec::new() });
        Ok(ino_of(index))
    }

    fn live(&self, fd: Fd) -> Result<(usize, u32), FsError> {
        let slot = fd.slot().ok_or(FsError::BadDescriptor)?;
        let ino = self.open[slot].and_then(|f| f.ino).ok_or(FsError::BadDescriptor)?;
        Ok((slot, ino))
    }

    fn inode(&self, ino: u32) -> Option<&Inode> {
        slot_of(ino).and_then(|i| self.inodes.get(i)).and_then(Option::as_ref)
    }

    fn inode_mut(&mut self, ino: u32) -> Option<&mut Inode> {
        slot_of(ino).and_then(|i| self.inodes.get_mut(i)).and_then(Option::as_mut)
    }
}

impl Default for FileStore {
    fn default() -> Self {
        Self::new()
    }
}

fn ino_of(index: usize) -> u32 {
    index as u32 + ROOT_INO + 1
}

fn slot_of(ino: u32) -> Option<usize> {
    (ino as usize).checked_sub(ROOT_INO as usize + 1)
}

/// Strips the leading `/` and validates the remaining name.
fn parse_path(path: &[u8]) -> Result<&[u8], FsError> {
    let name = path.strip_prefix(b"/").ok_or(FsError::InvalidPath)?;
    if name.is_empty() || name.contains(&b'/') || name.contains(&0) {
        return Err(FsError::InvalidPath);
    }
    if name.len() > MAX_NAME {
        return Err(FsError::NameTooLong);
    }
    Ok(name)
}

/// Debug view of a raw name.
struct Name<'a>(&'a [u8]);

impl fmt::Debug for Name<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match core::str::from_utf8(self.0) {
            Ok(s) => write!(f, "/{}", s),
            Err(_) => write!(f, "/{:x?}", self.0),
        }
    }
}
