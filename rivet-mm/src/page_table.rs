//! Sv39 page tables
//!
//! A virtual address below [`MAXVA`] is split into three 9-bit table indices
//! and a 12-bit page offset. Every table is one frame from the
//! [`FrameAllocator`] holding 512 entries. Only 4 KiB leaves are created; a
//! non-leaf entry carries `V` alone.

extern crate alloc;

use alloc::sync::Arc;
use core::fmt;

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::allocator::buddy::FrameAllocator;
use crate::arch;
use crate::config::KernelLayout;
use crate::error::{Fatal, MmError, Result};
use crate::layout::MAXVA;
use crate::physical::{PAGE_SHIFT, PAGE_SIZE, PhysAddr, copy_page, page_round_down};
use crate::virtual_mem::{LEVELS, PX_BITS, VirtAddr};

/// Entries per table
pub const ENTRIES: usize = 512;

/// `satp.MODE` value selecting Sv39
pub const SATP_SV39: usize = 8 << 60;

const PPN_SHIFT: u64 = 10;
const PPN_MASK: u64 = ((1 << 44) - 1) << PPN_SHIFT;

bitflags! {
    /// Sv39 PTE bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PteFlags: u64 {
        /// Valid
        const V = 1 << 0;
        /// Readable
        const R = 1 << 1;
        /// Writable
        const W = 1 << 2;
        /// Executable
        const X = 1 << 3;
        /// User accessible
        const U = 1 << 4;
        /// Global
        const G = 1 << 5;
        /// Accessed
        const A = 1 << 6;
        /// Dirty
        const D = 1 << 7;
        /// Copy-on-write (software, RSW bit 0)
        const COW = 1 << 8;
        /// The page becomes writable once the copy is made (RSW bit 1)
        const COW_WRITE = 1 << 9;
        /// Svpbmt non-cacheable
        const NC = 1 << 61;
        /// Svpbmt I/O
        const IO = 1 << 62;
    }
}

impl PteFlags {
    /// Read/write/execute bits
    pub const RWX: Self = Self::R.union(Self::W).union(Self::X);

    /// Flags for a page that no longer shares its frame: COW marks go away
    /// and `W` comes back if the copy was meant to be writable.
    pub fn without_cow(self) -> Self {
        if !self.contains(Self::COW) {
            return self;
        }
        let mut flags = self - Self::COW - Self::COW_WRITE;
        if self.contains(Self::COW_WRITE) {
            flags |= Self::W;
        }
        flags
    }
}

/// One page-table entry
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Pte(u64);

impl Pte {
    /// Entry pointing at `pa` with `flags`
    pub const fn new(pa: PhysAddr, flags: PteFlags) -> Self {
        Self((((pa.0 >> PAGE_SHIFT) as u64) << PPN_SHIFT) | flags.bits())
    }

    /// Raw bits
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Flag bits
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Physical page the entry points at
    pub const fn pa(self) -> PhysAddr {
        PhysAddr((((self.0 & PPN_MASK) >> PPN_SHIFT) as usize) << PAGE_SHIFT)
    }

    /// `V` set
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 & PteFlags::V.bits() != 0
    }

    /// Valid with at least one of R/W/X
    #[inline]
    pub const fn is_leaf(self) -> bool {
        self.is_valid() && self.0 & PteFlags::RWX.bits() != 0
    }

    /// Replace the flags, keeping the physical page
    pub fn set_flags(&mut self, flags: PteFlags) {
        *self = Self::new(self.pa(), flags);
    }

    /// Make the entry invalid
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl fmt::Debug for Pte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pte({:#x}, {:?})", self.pa(), self.flags())
    }
}

/// One 4 KiB table of 512 entries
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [Pte; ENTRIES],
}

const_assert_eq!(core::mem::size_of::<Pte>(), 8);
const_assert_eq!(core::mem::size_of::<PageTable>(), PAGE_SIZE);

/// Table stored in the frame at `pa`.
///
/// # Safety
/// `pa` must be a table frame owned by the caller's page-table tree.
unsafe fn table_at<'a>(pa: PhysAddr) -> &'a mut PageTable {
    unsafe { &mut *(pa.0 as *mut PageTable) }
}

/// How `copy_to` duplicates one populated user page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// Same frame in both tables, one more owner
    Share,
    /// Fresh frame with the same contents
    Copy,
    /// Same frame, write-protected in both tables until the first store
    CopyOnWrite,
}

/// A root table and the allocator its frames come from
pub struct PageTableRoot {
    root: PhysAddr,
    frames: Arc<FrameAllocator>,
    owns_leaves: bool,
    released: bool,
}

// The tree is reachable only through this handle.
unsafe impl Send for PageTableRoot {}

impl PageTableRoot {
    /// Allocate an empty root table
    pub fn create(frames: Arc<FrameAllocator>) -> Result<Self> {
        let root = frames.alloc_zeroed(PAGE_SIZE)?;
        Ok(Self {
            root,
            frames,
            owns_leaves: true,
            released: false,
        })
    }

    /// Build the kernel direct map described by `layout`.
    ///
    /// Kernel leaves point at fixed RAM and MMIO ranges, so tearing this table
    /// down never releases the frames behind them.
    pub fn kernel_table(frames: Arc<FrameAllocator>, layout: &KernelLayout) -> Result<Self> {
        let mut table = Self::create(frames)?;
        table.owns_leaves = false;
        for seg in &layout.segments {
            table.map(seg.va, seg.size, PhysAddr(seg.pa), seg.perm)?;
        }
        log::info!(
            "page_table: kernel map with {} segments at {:#x}",
            layout.segments.len(),
            table.root
        );
        Ok(table)
    }

    /// Physical address of the root table
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Frame allocator backing this tree
    pub fn frames(&self) -> &Arc<FrameAllocator> {
        &self.frames
    }

    /// `satp` value selecting this table
    pub fn satp(&self) -> usize {
        SATP_SV39 | (self.root.0 >> PAGE_SHIFT)
    }

    /// Switch the MMU to this table.
    ///
    /// # Safety
    /// The table must map the code that is currently executing.
    pub unsafe fn activate(&self) {
        unsafe { arch::write_satp(self.satp()) };
    }

    /// Drop any cached translation for `va`
    pub fn flush_page(&self, va: usize) {
        arch::sfence_vma_page(va);
    }

    /// Level-0 slot for `va`, creating intermediate tables when `alloc` is set.
    ///
    /// Returns `None` when a table on the way is missing and `alloc` is off.
    pub fn walk(&mut self, va: usize, alloc: bool) -> Result<Option<&mut Pte>> {
        let va = VirtAddr(va);
        if !va.is_valid() {
            return Err(MmError::OutOfRange);
        }
        let mut table = self.root;
        for level in (1..LEVELS).rev() {
            let pte = &mut unsafe { table_at(table) }.entries[va.px(level)];
            if pte.is_valid() {
                if pte.is_leaf() {
                    return Err(Fatal::NotLeaf(va.0).into());
                }
                table = pte.pa();
            } else {
                if !alloc {
                    return Ok(None);
                }
                let next = self.frames.alloc_zeroed(PAGE_SIZE)?;
                *pte = Pte::new(next, PteFlags::V);
                table = next;
            }
        }
        Ok(Some(&mut unsafe { table_at(table) }.entries[va.px(0)]))
    }

    /// Copy of the leaf entry for `va`, if one is installed
    pub fn entry(&self, va: usize) -> Option<Pte> {
        let va = VirtAddr(va);
        if !va.is_valid() {
            return None;
        }
        let mut table = self.root;
        for level in (1..LEVELS).rev() {
            let pte = unsafe { table_at(table) }.entries[va.px(level)];
            if !pte.is_valid() || pte.is_leaf() {
                return None;
            }
            table = pte.pa();
        }
        let pte = unsafe { table_at(table) }.entries[va.px(0)];
        pte.is_leaf().then_some(pte)
    }

    /// Translate `va`, including the page offset
    pub fn lookup(&self, va: usize) -> Option<PhysAddr> {
        self.entry(va).map(|pte| pte.pa().add(va % PAGE_SIZE))
    }

    /// Install leaves for `[va, va + size)` pointing at consecutive frames
    /// from `pa`.
    pub fn map(&mut self, va: usize, size: usize, pa: PhysAddr, perm: PteFlags) -> Result<()> {
        if size == 0 || !perm.intersects(PteFlags::RWX) {
            return Err(MmError::InvalidArgument);
        }
        if !pa.is_page_aligned() {
            return Err(MmError::Misaligned);
        }
        let last = page_round_down(va.checked_add(size - 1).ok_or(MmError::OutOfRange)?);
        let mut a = page_round_down(va);
        let mut pa = pa;
        loop {
            let Some(pte) = self.walk(a, true)? else {
                return Err(Fatal::OutOfFrames.into());
            };
            if pte.is_valid() {
                log::error!("page_table: remap at {:#x} ({:?})", a, pte);
                return Err(Fatal::Remap(a).into());
            }
            *pte = Pte::new(pa, perm | PteFlags::V);
            if a == last {
                return Ok(());
            }
            a += PAGE_SIZE;
            pa = pa.add(PAGE_SIZE);
        }
    }

    /// Remove `npages` leaves starting at `va`, skipping pages that were
    /// never populated. With `free`, each frame loses one owner.
    pub fn unmap(&mut self, va: usize, npages: usize, free: bool) -> Result<()> {
        if va % PAGE_SIZE != 0 {
            return Err(MmError::Misaligned);
        }
        let frames = self.frames.clone();
        self.for_each_leaf(va, va + npages * PAGE_SIZE, |a, pte| {
            let pa = pte.pa();
            pte.clear();
            arch::sfence_vma_page(a);
            if free {
                frames.release(pa)?;
            }
            Ok(())
        })
    }

    /// Apply `f` to the leaf at `va` if it is installed.
    ///
    /// Returns whether a leaf was found.
    pub fn update_leaf(&mut self, va: usize, f: impl FnOnce(&mut Pte)) -> Result<bool> {
        let Some(pte) = self.walk(va, false)? else {
            return Ok(false);
        };
        if !pte.is_leaf() {
            return Ok(false);
        }
        f(pte);
        self.flush_page(va);
        Ok(true)
    }

    /// Visit every installed leaf whose page lies in `[start, end)`, in
    /// address order. Empty subtrees are skipped without being entered.
    pub fn for_each_leaf<F>(&mut self, start: usize, end: usize, mut f: F) -> Result<()>
    where
        F: FnMut(usize, &mut Pte) -> Result<()>,
    {
        let end = end.min(MAXVA);
        if start >= end {
            return Ok(());
        }
        visit(self.root, LEVELS - 1, 0, start, end, &mut f)
    }

    /// Duplicate every populated page below `limit` into `new`.
    ///
    /// `mode_of(va)` decides per page how it is duplicated.
    pub fn copy_to<M>(&mut self, new: &mut PageTableRoot, limit: usize, mut mode_of: M) -> Result<()>
    where
        M: FnMut(usize) -> CopyMode,
    {
        let frames = self.frames.clone();
        self.for_each_leaf(0, limit, |va, pte| {
            let pa = pte.pa();
            let flags = pte.flags();
            match mode_of(va) {
                CopyMode::Share => {
                    frames.acquire(pa)?;
                    if let Err(e) = new.map(va, PAGE_SIZE, pa, flags) {
                        frames.release(pa)?;
                        return Err(e);
                    }
                }
                CopyMode::Copy => {
                    let fresh = frames.alloc_frame()?;
                    unsafe { copy_page(fresh, pa) };
                    if let Err(e) = new.map(va, PAGE_SIZE, fresh, flags.without_cow() - PteFlags::D) {
                        frames.free(fresh)?;
                        return Err(e);
                    }
                }
                CopyMode::CopyOnWrite => {
                    // Every shared leaf carries COW; COW_WRITE says whether
                    // the private copy may be written.
                    let mut shared = (flags - PteFlags::W) | PteFlags::COW;
                    if flags.intersects(PteFlags::W | PteFlags::COW_WRITE) {
                        shared |= PteFlags::COW_WRITE;
                    }
                    frames.acquire(pa)?;
                    if let Err(e) = new.map(va, PAGE_SIZE, pa, shared) {
                        frames.release(pa)?;
                        return Err(e);
                    }
                    pte.set_flags(shared);
                    arch::sfence_vma_page(va);
                }
            }
            Ok(())
        })
    }

    /// Release every leaf and free all table frames.
    pub fn destroy(mut self) -> Result<()> {
        self.teardown()
    }

    pub(crate) fn teardown(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let frames = self.frames.clone();
        let owns_leaves = self.owns_leaves;
        self.for_each_leaf(0, MAXVA, |_, pte| {
            let pa = pte.pa();
            pte.clear();
            if owns_leaves {
                frames.release(pa)?;
            }
            Ok(())
        })?;
        free_tables(&self.frames, self.root)
    }
}

impl Drop for PageTableRoot {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            log::error!("page_table: teardown of {:#x} failed: {}", self.root, e);
        }
    }
}

fn visit<F>(table: PhysAddr, level: usize, base: usize, start: usize, end: usize, f: &mut F) -> Result<()>
where
    F: FnMut(usize, &mut Pte) -> Result<()>,
{
    let span = PAGE_SIZE << (PX_BITS * level);
    for (i, pte) in unsafe { table_at(table) }.entries.iter_mut().enumerate() {
        let va = base + i * span;
        if va >= end {
            break;
        }
        if va + span <= start || !pte.is_valid() {
            continue;
        }
        match (pte.is_leaf(), level) {
            (true, 0) => f(va, pte)?,
            (false, 0) | (true, _) => return Err(Fatal::NotLeaf(va).into()),
            (false, _) => visit(pte.pa(), level - 1, va, start, end, f)?,
        }
    }
    Ok(())
}

/// Free a table and everything below it. All leaves must already be gone.
fn free_tables(frames: &FrameAllocator, table: PhysAddr) -> Result<()> {
    for pte in unsafe { table_at(table) }.entries.iter_mut() {
        if !pte.is_valid() {
            continue;
        }
        if pte.is_leaf() {
            log::error!("page_table: leaf {:?} left in table {:#x}", pte, table);
            return Err(Fatal::LeafInTeardown(table).into());
        }
        free_tables(frames, pte.pa())?;
        pte.clear();
    }
    frames.free(table)
}
