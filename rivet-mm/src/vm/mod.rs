//! Per-process virtual memory
//!
//! An [`AddressSpace`] owns a page table, the process's mmap [`RegionList`]
//! and its program break. Nothing is populated eagerly except by
//! [`AddressSpace::alloc_image`]: mmap regions and the heap below `brk` are
//! filled one page at a time by [`AddressSpace::handle_fault`].
//!
//! Frame ownership follows the leaf entries. Every leaf that points at a
//! frame holds one reference on it; fork and mremap add references, unmapping
//! and COW resolution drop them.

extern crate alloc;

use alloc::sync::Arc;

use crate::allocator::buddy::FrameAllocator;
use crate::allocator::slab::ObjectCache;
use crate::config::{ForkPolicy, MemoryConfig};
use crate::error::{MmError, Result};
use crate::layout::{MMAP_BASE, MMAP_END};
use crate::page_table::{CopyMode, PageTableRoot};
use crate::physical::{PAGE_SIZE, PhysAddr, page_round_up, pages_for};

pub mod fault;
pub mod file;
pub mod mmap;
pub mod region;
pub mod syscall;
pub mod uaccess;

pub use file::{MappedFile, MemFile};
pub use mmap::{MremapFlags, MsyncFlags};
pub use region::{FaultKind, MapFlags, Prot, Region, RegionList};

/// Protection of lazily grown heap pages
pub const HEAP_PROT: Prot = Prot::READ.union(Prot::WRITE);

/// Allocators shared by every address space
pub struct MmContext {
    frames: Arc<FrameAllocator>,
    regions: ObjectCache<Region>,
    fork_policy: ForkPolicy,
}

impl MmContext {
    pub fn new(frames: Arc<FrameAllocator>, fork_policy: ForkPolicy) -> Result<Arc<Self>> {
        let regions = ObjectCache::new("mmap_region", frames.clone())?;
        Ok(Arc::new(Self {
            frames,
            regions,
            fork_policy,
        }))
    }

    /// Build the frame allocator and region cache for a board.
    ///
    /// # Safety
    /// The configured physical range must satisfy [`FrameAllocator::new`].
    pub unsafe fn from_config(config: &MemoryConfig) -> Result<Arc<Self>> {
        let frames = Arc::new(unsafe { FrameAllocator::from_config(config)? });
        Self::new(frames, config.fork_policy)
    }

    pub fn frames(&self) -> &Arc<FrameAllocator> {
        &self.frames
    }

    /// Cache the region records come from
    pub fn region_cache(&self) -> &ObjectCache<Region> {
        &self.regions
    }

    pub fn fork_policy(&self) -> ForkPolicy {
        self.fork_policy
    }
}

/// A user address space
pub struct AddressSpace {
    ctx: Arc<MmContext>,
    table: PageTableRoot,
    regions: RegionList,
    brk: usize,
    exited: bool,
}

impl AddressSpace {
    /// Empty address space with its own root table
    pub fn new(ctx: Arc<MmContext>) -> Result<Self> {
        let table = PageTableRoot::create(ctx.frames.clone()).map_err(MmError::recoverable_oom)?;
        Ok(Self {
            ctx,
            table,
            regions: RegionList::new(),
            brk: 0,
            exited: false,
        })
    }

    pub fn context(&self) -> &Arc<MmContext> {
        &self.ctx
    }

    pub fn page_table(&self) -> &PageTableRoot {
        &self.table
    }

    /// mmap regions in address order
    pub fn regions(&self) -> &RegionList {
        &self.regions
    }

    /// Current program break
    pub fn brk(&self) -> usize {
        self.brk
    }

    /// Physical address behind `va`, if populated
    pub fn translate(&self, va: usize) -> Option<PhysAddr> {
        self.table.lookup(va)
    }

    /// Duplicate this address space for a child process.
    ///
    /// SHARED pages are shared with one more reference. Everything else is
    /// copied eagerly or marked copy-on-write, depending on the context's
    /// [`ForkPolicy`]. Running out of frames drops the partial child and
    /// reports [`MmError::NoMemory`].
    pub fn fork(&mut self) -> Result<AddressSpace> {
        let mut child = AddressSpace::new(self.ctx.clone())?;
        child.brk = self.brk;
        for region in self.regions.iter() {
            let copy = region.slice(region.start, region.end());
            child.regions.insert(&self.ctx.regions, copy)?;
        }

        let private = match self.ctx.fork_policy {
            ForkPolicy::EagerCopy => CopyMode::Copy,
            ForkPolicy::CopyOnWrite => CopyMode::CopyOnWrite,
        };
        let regions = &self.regions;
        self.table
            .copy_to(&mut child.table, MMAP_END, |va| match regions.find(va) {
                Some(region) if region.is_shared() => CopyMode::Share,
                _ => private,
            })
            .map_err(MmError::recoverable_oom)?;

        log::debug!(
            "vm: fork copied {} regions, brk {:#x}, policy {:?}",
            child.regions.len(),
            child.brk,
            self.ctx.fork_policy
        );
        Ok(child)
    }

    /// Move the break by `delta` bytes and return the old break.
    ///
    /// Growth is lazy; shrinking unmaps and releases the pages above the new
    /// break.
    pub fn sbrk(&mut self, delta: isize) -> Result<usize> {
        let old = self.brk;
        if delta >= 0 {
            let new = old
                .checked_add(delta as usize)
                .filter(|&new| new <= MMAP_BASE)
                .ok_or(MmError::NoMemory)?;
            self.brk = new;
        } else {
            let new = old.checked_sub(delta.unsigned_abs()).ok_or(MmError::InvalidArgument)?;
            self.shrink_heap(new)?;
        }
        Ok(old)
    }

    /// Grow the image to `new_sz` bytes, populating every new page now.
    ///
    /// Used when loading a program. If frames run out the pages added by
    /// this call are released again and [`MmError::NoMemory`] is returned.
    pub fn alloc_image(&mut self, new_sz: usize, prot: Prot) -> Result<usize> {
        if new_sz > MMAP_BASE {
            return Err(MmError::NoMemory);
        }
        if new_sz < self.brk {
            self.shrink_heap(new_sz)?;
            return Ok(new_sz);
        }
        let first = page_round_up(self.brk);
        let mut va = first;
        while va < new_sz {
            if let Err(e) = self.populate_zeroed(va, prot) {
                self.table.unmap(first, pages_for(va - first), true)?;
                return Err(e.recoverable_oom());
            }
            va += PAGE_SIZE;
        }
        self.brk = new_sz;
        Ok(new_sz)
    }

    /// Tear the address space down, writing back dirty shared pages.
    pub fn exit(mut self) -> Result<()> {
        self.teardown()
    }

    fn populate_zeroed(&mut self, va: usize, prot: Prot) -> Result<()> {
        let frame = self.ctx.frames.alloc_zeroed(PAGE_SIZE)?;
        if let Err(e) = self.table.map(va, PAGE_SIZE, frame, prot.leaf_flags()) {
            self.ctx.frames.free(frame)?;
            return Err(e);
        }
        Ok(())
    }

    fn shrink_heap(&mut self, new: usize) -> Result<()> {
        let from = page_round_up(new);
        let to = page_round_up(self.brk);
        if to > from {
            self.table.unmap(from, pages_for(to - from), true)?;
        }
        self.brk = new;
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        if self.exited {
            return Ok(());
        }
        self.exited = true;
        while let Some((start, len)) = self.regions.iter().next().map(|r| (r.start, r.len)) {
            self.munmap(start, len)?;
        }
        self.table.teardown()
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            log::error!("vm: address space teardown failed: {}", e);
            if let Err(e) = self.regions.clear(&self.ctx.regions) {
                log::error!("vm: dropping region records failed: {}", e);
            }
        }
    }
}
