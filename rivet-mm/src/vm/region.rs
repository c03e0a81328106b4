//! Mapping regions
//!
//! Each process keeps its mmap regions as a singly linked, address-ordered
//! list of records allocated from the [`ObjectCache<Region>`] in its
//! [`MmContext`](super::MmContext). Regions never overlap.

extern crate alloc;

use alloc::sync::Arc;
use core::fmt;
use core::marker::PhantomData;
use core::ptr::NonNull;

use bitflags::bitflags;

use super::file::MappedFile;
use crate::allocator::slab::ObjectCache;
use crate::error::Result;
use crate::layout::{MMAP_BASE, MMAP_END};
use crate::page_table::PteFlags;

bitflags! {
    /// Page protection requested by `mmap`/`mprotect`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Prot: u32 {
        /// Readable
        const READ = 0x1;
        /// Writable
        const WRITE = 0x2;
        /// Executable
        const EXEC = 0x4;
    }
}

bitflags! {
    /// Mapping type and placement
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MapFlags: u32 {
        /// Writes are visible to every sharer and reach the file
        const SHARED = 0x01;
        /// Writes stay private to the address space
        const PRIVATE = 0x02;
        /// Place the mapping exactly at the given address
        const FIXED = 0x10;
        /// Zero-filled, no backing file
        const ANONYMOUS = 0x20;
    }
}

/// Kind of access that faulted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Load page fault
    Load,
    /// Store/AMO page fault
    Store,
    /// Instruction page fault
    Instruction,
}

impl Prot {
    /// Whether an access of `kind` is allowed
    pub fn permits(self, kind: FaultKind) -> bool {
        match kind {
            FaultKind::Load => self.intersects(Prot::READ | Prot::WRITE),
            FaultKind::Store => self.contains(Prot::WRITE),
            FaultKind::Instruction => self.contains(Prot::EXEC),
        }
    }

    /// User leaf bits for this protection. Writable pages are also readable.
    ///
    /// A populated page under `PROT_NONE` stays mapped as a kernel-only read
    /// leaf so its frame is kept while user access faults.
    pub fn leaf_flags(self) -> PteFlags {
        if self.is_empty() {
            return PteFlags::R;
        }
        let mut flags = PteFlags::U;
        if self.intersects(Prot::READ | Prot::WRITE) {
            flags |= PteFlags::R;
        }
        if self.contains(Prot::WRITE) {
            flags |= PteFlags::W;
        }
        if self.contains(Prot::EXEC) {
            flags |= PteFlags::X;
        }
        flags
    }
}

/// One mmap region
pub struct Region {
    /// First byte, page aligned
    pub start: usize,
    /// Length in bytes, page rounded
    pub len: usize,
    /// Protection
    pub prot: Prot,
    /// PRIVATE or SHARED, plus the flags the region was created with
    pub flags: MapFlags,
    /// Backing file; holding it keeps the file open
    pub file: Option<Arc<dyn MappedFile>>,
    /// File offset of `start`
    pub offset: u64,
    next: Option<NonNull<Region>>,
}

impl Region {
    /// Unlinked region record
    pub fn new(
        start: usize,
        len: usize,
        prot: Prot,
        flags: MapFlags,
        file: Option<Arc<dyn MappedFile>>,
        offset: u64,
    ) -> Self {
        Self {
            start,
            len,
            prot,
            flags,
            file,
            offset,
            next: None,
        }
    }

    /// One past the last byte
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Whether `[start, end)` intersects this region
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        start < self.end() && self.start < end
    }

    pub fn is_shared(&self) -> bool {
        self.flags.contains(MapFlags::SHARED)
    }

    /// Dirty pages of this region go back to its file
    pub fn writes_back(&self) -> bool {
        self.is_shared() && self.file.as_ref().is_some_and(|f| f.writable())
    }

    /// File offset backing `va`
    pub fn file_offset(&self, va: usize) -> u64 {
        self.offset + (va - self.start) as u64
    }

    /// Unlinked copy covering `[start, end)` of this region
    pub fn slice(&self, start: usize, end: usize) -> Region {
        Region::new(
            start,
            end - start,
            self.prot,
            self.flags,
            self.file.clone(),
            self.file_offset(start),
        )
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("start", &format_args!("{:#x}", self.start))
            .field("len", &format_args!("{:#x}", self.len))
            .field("prot", &self.prot)
            .field("flags", &self.flags)
            .field("file", &self.file.is_some())
            .field("offset", &self.offset)
            .finish()
    }
}

/// Address-ordered list of regions
#[derive(Default)]
pub struct RegionList {
    head: Option<NonNull<Region>>,
    len: usize,
}

// Nodes are owned by the list and reached only through it.
unsafe impl Send for RegionList {}

impl RegionList {
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    /// Number of regions
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            cur: self.head,
            _marker: PhantomData,
        }
    }

    /// Region containing `addr`
    pub fn find(&self, addr: usize) -> Option<&Region> {
        self.iter().take_while(|r| r.start <= addr).find(|r| r.contains(addr))
    }

    /// Mutable access to the region starting exactly at `start`
    pub fn find_mut(&mut self, start: usize) -> Option<&mut Region> {
        let mut cur = self.head;
        while let Some(node) = cur {
            let region = unsafe { &mut *node.as_ptr() };
            if region.start == start {
                return Some(region);
            }
            cur = region.next;
        }
        None
    }

    /// Whether any region intersects `[start, end)`
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        self.iter().any(|r| r.overlaps(start, end))
    }

    /// Start of the first region at or after `addr`, or `MMAP_END`
    pub fn next_start(&self, addr: usize) -> usize {
        self.iter().map(|r| r.start).find(|&s| s >= addr).unwrap_or(MMAP_END)
    }

    /// First address-ordered gap of `len` bytes in the mmap window
    pub fn free_gap(&self, len: usize) -> Option<usize> {
        let mut cursor = MMAP_BASE;
        for region in self.iter() {
            if region.end() <= cursor {
                continue;
            }
            if region.start >= cursor && region.start - cursor >= len {
                return Some(cursor);
            }
            cursor = cursor.max(region.end());
        }
        (MMAP_END.saturating_sub(cursor) >= len).then_some(cursor)
    }

    /// Link a new record in address order
    pub fn insert(&mut self, cache: &ObjectCache<Region>, region: Region) -> Result<()> {
        let node = cache.alloc(region)?;
        let start = unsafe { node.as_ref().start };
        let mut link = &mut self.head;
        while let Some(cur) = *link {
            let cur = unsafe { &mut *cur.as_ptr() };
            if cur.start > start {
                break;
            }
            link = &mut cur.next;
        }
        unsafe { (*node.as_ptr()).next = *link };
        *link = Some(node);
        self.len += 1;
        Ok(())
    }

    /// Unlink the region starting at `start` and hand back its record
    pub fn remove(&mut self, cache: &ObjectCache<Region>, start: usize) -> Result<Option<Region>> {
        let mut link = &mut self.head;
        while let Some(cur) = *link {
            let region = unsafe { &mut *cur.as_ptr() };
            if region.start == start {
                *link = region.next.take();
                self.len -= 1;
                return unsafe { cache.free(cur) }.map(Some);
            }
            link = &mut region.next;
        }
        Ok(None)
    }

    /// Drop every record
    pub fn clear(&mut self, cache: &ObjectCache<Region>) -> Result<()> {
        while let Some(node) = self.head {
            let start = unsafe { node.as_ref().start };
            self.remove(cache, start)?;
        }
        Ok(())
    }
}

/// Iterator over a [`RegionList`]
pub struct Iter<'a> {
    cur: Option<NonNull<Region>>,
    _marker: PhantomData<&'a Region>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Region;

    fn next(&mut self) -> Option<&'a Region> {
        let node = self.cur?;
        let region = unsafe { &*node.as_ptr() };
        self.cur = region.next;
        Some(region)
    }
}
