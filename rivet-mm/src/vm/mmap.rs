//! mmap, munmap, mprotect, msync and mremap
//!
//! All of these validate their arguments before touching any state, so a
//! rejected call leaves the address space exactly as it was.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::slice;

use bitflags::bitflags;

use super::AddressSpace;
use super::file::MappedFile;
use super::region::{MapFlags, Prot, Region};
use crate::arch;
use crate::error::{MmError, Result};
use crate::layout::{MAXVA, MMAP_MAX_LEN, in_mmap_window};
use crate::page_table::{PageTableRoot, PteFlags};
use crate::physical::{PAGE_SIZE, page_round_up, pages_for};

bitflags! {
    /// `msync` flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MsyncFlags: u32 {
        /// Schedule the write-back
        const ASYNC = 1;
        /// Drop cached copies so later reads see the file
        const INVALIDATE = 2;
        /// Write back before returning
        const SYNC = 4;
    }
}

bitflags! {
    /// `mremap` flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MremapFlags: u32 {
        /// Accepted for compatibility; a mapping that cannot grow in place
        /// always moves
        const MAYMOVE = 1;
    }
}

/// Write every dirty page of `region` in `[lo, hi)` back to its file and
/// clear `D`. Only bytes below the current end of file are written.
fn write_back(table: &mut PageTableRoot, region: &Region, lo: usize, hi: usize) -> Result<usize> {
    let Some(file) = region.file.as_ref() else {
        return Ok(0);
    };
    let size = file.size();
    let mut pages = 0;
    table.for_each_leaf(lo, hi, |va, pte| {
        let flags = pte.flags();
        if !flags.contains(PteFlags::D) {
            return Ok(());
        }
        let offset = region.file_offset(va);
        if offset < size {
            let n = (size - offset).min(PAGE_SIZE as u64) as usize;
            let bytes = unsafe { slice::from_raw_parts(pte.pa().as_mut_ptr().cast_const(), n) };
            file.write_at(bytes, offset)?;
            pages += 1;
        }
        pte.set_flags(flags - PteFlags::D);
        arch::sfence_vma_page(va);
        Ok(())
    })?;
    Ok(pages)
}

fn checked_range(addr: usize, len: usize) -> Result<usize> {
    if addr % PAGE_SIZE != 0 {
        return Err(MmError::Misaligned);
    }
    addr.checked_add(page_round_up(len))
        .filter(|&end| end <= MAXVA)
        .ok_or(MmError::OutOfRange)
}

impl AddressSpace {
    /// Create a mapping and return its address. Nothing is populated until
    /// the first fault.
    pub fn mmap(
        &mut self,
        addr: usize,
        len: usize,
        prot: Prot,
        flags: MapFlags,
        file: Option<Arc<dyn MappedFile>>,
        offset: u64,
    ) -> Result<usize> {
        if flags.contains(MapFlags::SHARED) == flags.contains(MapFlags::PRIVATE) {
            return Err(MmError::InvalidArgument);
        }
        if len == 0 {
            return Err(MmError::InvalidArgument);
        }
        if len > MMAP_MAX_LEN {
            return Err(MmError::NoSpace);
        }
        let len = page_round_up(len);

        let (file, offset) = if flags.contains(MapFlags::ANONYMOUS) {
            (None, 0)
        } else {
            let file = file.ok_or(MmError::BadFile)?;
            if offset % PAGE_SIZE as u64 != 0 {
                return Err(MmError::Misaligned);
            }
            if flags.contains(MapFlags::SHARED) && prot.contains(Prot::WRITE) && !file.writable() {
                return Err(MmError::PermissionDenied);
            }
            (Some(file), offset)
        };

        let start = if flags.contains(MapFlags::FIXED) {
            if addr % PAGE_SIZE != 0 {
                return Err(MmError::Misaligned);
            }
            if !in_mmap_window(addr, len) {
                return Err(MmError::OutOfRange);
            }
            if self.regions.overlaps(addr, addr + len) {
                return Err(MmError::Overlap);
            }
            addr
        } else {
            self.regions.free_gap(len).ok_or(MmError::NoSpace)?
        };

        let flags = flags - MapFlags::FIXED;
        self.regions
            .insert(&self.ctx.regions, Region::new(start, len, prot, flags, file, offset))?;
        log::debug!("vm: mmap {:#x}..{:#x} {:?} {:?}", start, start + len, prot, flags);
        Ok(start)
    }

    /// Remove mappings in `[addr, addr + len)`.
    ///
    /// Dirty pages of SHARED file mappings are written back first. Regions
    /// cut at the edges of the range keep their remaining parts. Unmapping a
    /// range with no mappings succeeds.
    pub fn munmap(&mut self, addr: usize, len: usize) -> Result<()> {
        if len == 0 {
            return Err(MmError::InvalidArgument);
        }
        let end = checked_range(addr, len)?;
        let starts: Vec<usize> = self
            .regions
            .iter()
            .filter(|r| r.overlaps(addr, end))
            .map(|r| r.start)
            .collect();
        for start in starts {
            self.unmap_in_region(start, addr, end)?;
        }
        Ok(())
    }

    fn unmap_in_region(&mut self, start: usize, addr: usize, end: usize) -> Result<()> {
        let Some(region) = self.regions.find(start) else {
            return Ok(());
        };
        let (rs, re) = (region.start, region.end());
        let (lo, hi) = (addr.max(rs), end.min(re));

        // A hole in the middle needs a record for the tail before anything
        // else changes.
        if lo > rs && hi < re {
            let tail = region.slice(hi, re);
            self.regions.insert(&self.ctx.regions, tail)?;
        }

        if let Some(region) = self.regions.find(rs).filter(|r| r.writes_back()) {
            match write_back(&mut self.table, region, lo, hi) {
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => log::warn!("vm: write-back of {:#x}..{:#x} failed: {}", lo, hi, e),
                Ok(_) => {}
            }
        }
        self.table.unmap(lo, pages_for(hi - lo), true)?;

        if lo == rs && hi == re {
            self.regions.remove(&self.ctx.regions, rs)?;
        } else if let Some(region) = self.regions.find_mut(rs) {
            if lo == rs {
                region.offset = region.file_offset(hi);
                region.start = hi;
                region.len = re - hi;
            } else {
                region.len = lo - rs;
            }
        }
        log::debug!("vm: munmap {:#x}..{:#x} from region at {:#x}", lo, hi, rs);
        Ok(())
    }

    /// Change the protection of `[addr, addr + len)`.
    ///
    /// The range must be fully mapped. Installed leaves are updated in place;
    /// copy-on-write leaves stay read-only and only remember whether the copy
    /// may be written.
    pub fn mprotect(&mut self, addr: usize, len: usize, prot: Prot) -> Result<()> {
        let end = checked_range(addr, len)?;
        if addr == end {
            return Ok(());
        }
        self.check_covered(addr, end)?;
        let denied = self.regions.iter().filter(|r| r.overlaps(addr, end)).any(|r| {
            prot.contains(Prot::WRITE) && r.is_shared() && r.file.as_ref().is_some_and(|f| !f.writable())
        });
        if denied {
            return Err(MmError::PermissionDenied);
        }

        self.split_region(addr)?;
        self.split_region(end)?;

        let base = prot.leaf_flags();
        let starts: Vec<usize> = self
            .regions
            .iter()
            .filter(|r| r.overlaps(addr, end))
            .map(|r| r.start)
            .collect();
        for start in starts {
            let Some(region) = self.regions.find_mut(start) else {
                continue;
            };
            region.prot = prot;
            let (lo, hi) = (region.start, region.end());
            self.table.for_each_leaf(lo, hi, |va, pte| {
                let old = pte.flags();
                let mut flags = base | PteFlags::V | (old & (PteFlags::A | PteFlags::D));
                if old.contains(PteFlags::COW) {
                    flags = (flags - PteFlags::W) | PteFlags::COW;
                    if base.contains(PteFlags::W) {
                        flags |= PteFlags::COW_WRITE;
                    }
                }
                pte.set_flags(flags);
                arch::sfence_vma_page(va);
                Ok(())
            })?;
        }
        log::debug!("vm: mprotect {:#x}..{:#x} {:?}", addr, end, prot);
        Ok(())
    }

    /// Write dirty pages of SHARED file mappings in the range back to their
    /// files without unmapping them.
    pub fn msync(&mut self, addr: usize, len: usize, flags: MsyncFlags) -> Result<()> {
        if flags.contains(MsyncFlags::ASYNC | MsyncFlags::SYNC) {
            return Err(MmError::InvalidArgument);
        }
        let end = checked_range(addr, len)?;
        if addr == end {
            return Ok(());
        }
        self.check_covered(addr, end)?;
        let mut pages = 0;
        for region in self.regions.iter().filter(|r| r.overlaps(addr, end) && r.writes_back()) {
            let (lo, hi) = (addr.max(region.start), end.min(region.end()));
            pages += write_back(&mut self.table, region, lo, hi)?;
        }
        log::debug!("vm: msync {:#x}..{:#x} wrote {} pages", addr, end, pages);
        Ok(())
    }

    /// Resize the mapping at `old`, which must be exactly one whole region.
    ///
    /// Shrinking and growing into free space happen in place. Otherwise a
    /// new region is created, the populated pages are carried over and the
    /// old region is unmapped. If the new region cannot be set up the old one
    /// is left untouched.
    pub fn mremap(&mut self, old: usize, old_len: usize, new_len: usize, _flags: MremapFlags) -> Result<usize> {
        if old % PAGE_SIZE != 0 {
            return Err(MmError::Misaligned);
        }
        if old_len == 0 || new_len == 0 {
            return Err(MmError::InvalidArgument);
        }
        if new_len > MMAP_MAX_LEN {
            return Err(MmError::NoSpace);
        }
        let (old_len, new_len) = (page_round_up(old_len), page_round_up(new_len));
        let region = self
            .regions
            .find(old)
            .filter(|r| r.start == old && r.len == old_len)
            .ok_or(MmError::InvalidArgument)?;

        if new_len == old_len {
            return Ok(old);
        }
        if new_len < old_len {
            self.munmap(old + new_len, old_len - new_len)?;
            return Ok(old);
        }
        if old + new_len <= self.regions.next_start(region.end()) {
            if let Some(region) = self.regions.find_mut(old) {
                region.len = new_len;
            }
            log::debug!("vm: mremap {:#x} grew in place to {:#x}", old, new_len);
            return Ok(old);
        }
        let new = self.regions.free_gap(new_len).ok_or(MmError::NoSpace)?;
        let moved = Region::new(
            new,
            new_len,
            region.prot,
            region.flags,
            region.file.clone(),
            region.offset,
        );
        self.regions.insert(&self.ctx.regions, moved)?;

        if let Err(e) = self.carry_pages(old, old_len, new) {
            self.table.unmap(new, pages_for(new_len), true)?;
            self.regions.remove(&self.ctx.regions, new)?;
            log::warn!("vm: mremap of {:#x} to {:#x} failed: {}", old, new, e);
            return Err(e.recoverable_oom());
        }
        self.munmap(old, old_len)?;
        log::debug!("vm: mremap moved {:#x} -> {:#x} ({:#x} bytes)", old, new, new_len);
        Ok(new)
    }

    /// Map the populated pages of `[old, old + len)` at `new` as well, with
    /// one more reference each.
    fn carry_pages(&mut self, old: usize, len: usize, new: usize) -> Result<()> {
        let mut leaves = Vec::new();
        self.table.for_each_leaf(old, old + len, |va, pte| {
            leaves.push((va, *pte));
            Ok(())
        })?;
        for (va, pte) in leaves {
            self.ctx.frames.acquire(pte.pa())?;
            if let Err(e) = self.table.map(new + (va - old), PAGE_SIZE, pte.pa(), pte.flags()) {
                self.ctx.frames.release(pte.pa())?;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Every byte of `[addr, end)` must belong to some region.
    fn check_covered(&self, addr: usize, end: usize) -> Result<()> {
        let mut cursor = addr;
        for region in self.regions.iter().filter(|r| r.overlaps(addr, end)) {
            if region.start > cursor {
                return Err(MmError::NoMemory);
            }
            cursor = region.end();
        }
        if cursor < end {
            return Err(MmError::NoMemory);
        }
        Ok(())
    }

    /// Split the region strictly containing `at` into two records.
    fn split_region(&mut self, at: usize) -> Result<()> {
        let Some(region) = self.regions.find(at).filter(|r| r.start < at) else {
            return Ok(());
        };
        let start = region.start;
        let tail = region.slice(at, region.end());
        self.regions.insert(&self.ctx.regions, tail)?;
        if let Some(region) = self.regions.find_mut(start) {
            region.len = at - start;
        }
        Ok(())
    }
}
