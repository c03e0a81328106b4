//! Buddy page-frame allocator
//!
//! Every physical page has a [`PageFrame`] descriptor in a flat array indexed
//! by frame number (relative to the managed base). Free memory is kept as
//! power-of-two blocks on one doubly linked list per order; the links are
//! frame indices stored in the descriptors, so the allocator never touches the
//! free pages themselves.
//!
//! The descriptor of a block's first frame (its head) carries the order and
//! the reference count. A block at index `i` of order `k` has its buddy at
//! `i ^ (1 << k)`.

extern crate alloc;

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::config::{MAX_BLOCK_SIZE, MAX_ORDER, MemoryConfig, ORDER_COUNT};
use crate::error::{Fatal, MmError, Result};
use crate::physical::{PAGE_SHIFT, PAGE_SIZE, PhysAddr, zero_page};
use crate::sync::IrqMutex;

/// End-of-list marker for free-list links
const NIL: u32 = u32::MAX;

bitflags! {
    /// Frame descriptor state
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u8 {
        /// Head of a block currently on a free list
        const FREE = 1 << 0;
        /// Head of an allocated block
        const HEAD = 1 << 1;
    }
}

/// Per-frame descriptor
#[derive(Debug, Clone, Copy)]
pub struct PageFrame {
    /// Block order, meaningful on block heads only
    pub order: u8,
    /// Descriptor flags
    pub flags: FrameFlags,
    /// Number of leaf entries referencing this frame (allocated heads only)
    pub refcount: u32,
    prev: u32,
    next: u32,
}

impl PageFrame {
    const fn new() -> Self {
        Self {
            order: 0,
            flags: FrameFlags::empty(),
            refcount: 0,
            prev: NIL,
            next: NIL,
        }
    }
}

/// Allocator statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuddyStats {
    /// Successful block allocations
    pub allocations: u64,
    /// Blocks returned
    pub frees: u64,
    /// Blocks split while serving a request
    pub splits: u64,
    /// Buddy merges performed on free
    pub merges: u64,
}

struct BuddyState {
    frames: Vec<PageFrame>,
    free_lists: [u32; ORDER_COUNT],
    free_frames: usize,
    stats: BuddyStats,
}

impl BuddyState {
    fn push(&mut self, idx: usize, order: usize) {
        let head = self.free_lists[order];
        let frame = &mut self.frames[idx];
        frame.order = order as u8;
        frame.flags = FrameFlags::FREE;
        frame.refcount = 0;
        frame.prev = NIL;
        frame.next = head;
        if head != NIL {
            self.frames[head as usize].prev = idx as u32;
        }
        self.free_lists[order] = idx as u32;
    }

    fn unlink(&mut self, idx: usize) {
        let PageFrame { prev, next, order, .. } = self.frames[idx];
        if prev != NIL {
            self.frames[prev as usize].next = next;
        } else {
            self.free_lists[order as usize] = next;
        }
        if next != NIL {
            self.frames[next as usize].prev = prev;
        }
        let frame = &mut self.frames[idx];
        frame.flags.remove(FrameFlags::FREE);
        frame.prev = NIL;
        frame.next = NIL;
    }

    fn pop(&mut self, order: usize) -> Option<usize> {
        let head = self.free_lists[order];
        if head == NIL {
            return None;
        }
        self.unlink(head as usize);
        Some(head as usize)
    }

    /// Split the block at `idx` from order `from` down to `to`, keeping the
    /// lower half and listing each upper half as free.
    fn split(&mut self, idx: usize, from: usize, to: usize) {
        if from == to {
            return;
        }
        let half = from - 1;
        self.push(idx + (1 << half), half);
        self.stats.splits += 1;
        log::trace!("buddy: split frame {} order {} -> {}", idx, from, half);
        self.split(idx, half, to);
    }

    /// Put a block back, merging with its buddy for as long as possible.
    fn coalesce(&mut self, idx: usize, order: usize) {
        if order == MAX_ORDER {
            self.push(idx, order);
            return;
        }
        let buddy = idx ^ (1 << order);
        let buddy_free = buddy + (1 << order) <= self.frames.len()
            && self.frames[buddy].flags.contains(FrameFlags::FREE)
            && self.frames[buddy].order as usize == order;
        if !buddy_free {
            self.push(idx, order);
            return;
        }
        self.unlink(buddy);
        self.frames[buddy].order = 0;
        self.frames[idx].order = 0;
        self.stats.merges += 1;
        self.coalesce(idx.min(buddy), order + 1);
    }

    fn head_of(&self, idx: usize) -> Option<usize> {
        let mut i = idx;
        loop {
            let frame = &self.frames[i];
            if frame.flags.intersects(FrameFlags::HEAD | FrameFlags::FREE) {
                let covers = idx < i + (1usize << frame.order);
                return (frame.flags.contains(FrameFlags::HEAD) && covers).then_some(i);
            }
            if i == 0 {
                return None;
            }
            i -= 1;
        }
    }

    fn check(&self) -> bool {
        let mut listed = 0usize;
        for order in 0..ORDER_COUNT {
            let mut cur = self.free_lists[order];
            let mut prev = NIL;
            while cur != NIL {
                let frame = &self.frames[cur as usize];
                if !frame.flags.contains(FrameFlags::FREE)
                    || frame.order as usize != order
                    || frame.prev != prev
                    || (cur as usize) % (1 << order) != 0
                {
                    return false;
                }
                listed += 1 << order;
                prev = cur;
                cur = frame.next;
            }
        }
        listed == self.free_frames
    }
}

/// Physical frame allocator for one contiguous range of RAM
pub struct FrameAllocator {
    base: usize,
    nframes: usize,
    state: IrqMutex<BuddyState>,
}

// Descriptors hold indices only; the memory range itself is owned exclusively
// by the allocator per the contract of `new`.
unsafe impl Send for FrameAllocator {}
unsafe impl Sync for FrameAllocator {}

impl FrameAllocator {
    /// Take ownership of `nframes` pages starting at `base`.
    ///
    /// The frames are carved into the largest aligned blocks that fit, so a
    /// range of `k * 2^MAX_ORDER` frames starts as `k` maximal blocks.
    ///
    /// # Safety
    /// - `base` must be page aligned and `[base, base + nframes * PAGE_SIZE)`
    ///   must be valid, identity-addressable RAM
    /// - nothing else may access that memory except through frames handed out
    ///   by this allocator
    pub unsafe fn new(base: usize, nframes: usize) -> Self {
        assert!(base % PAGE_SIZE == 0, "frame allocator base {:#x} not page aligned", base);
        assert!(nframes < NIL as usize, "too many frames");

        let mut state = BuddyState {
            frames: alloc::vec![PageFrame::new(); nframes],
            free_lists: [NIL; ORDER_COUNT],
            free_frames: nframes,
            stats: BuddyStats::default(),
        };

        let mut idx = 0;
        while idx < nframes {
            let mut order = MAX_ORDER;
            while idx % (1 << order) != 0 || idx + (1 << order) > nframes {
                order -= 1;
            }
            state.push(idx, order);
            idx += 1 << order;
        }

        log::info!(
            "buddy: managing {} frames at {:#x}..{:#x}",
            nframes,
            base,
            base + nframes * PAGE_SIZE
        );

        Self {
            base,
            nframes,
            state: IrqMutex::new(state),
        }
    }

    /// Build the allocator for the range described by `config`.
    ///
    /// # Safety
    /// Same contract as [`FrameAllocator::new`] for the configured range.
    pub unsafe fn from_config(config: &MemoryConfig) -> Result<Self> {
        config.validate()?;
        Ok(unsafe { Self::new(config.phys_base, config.frame_count()) })
    }

    /// Smallest order whose block covers `size` bytes
    pub fn order_for(size: usize) -> Result<usize> {
        let pages = size.max(1).div_ceil(PAGE_SIZE);
        let order = pages.next_power_of_two().trailing_zeros() as usize;
        if size > MAX_BLOCK_SIZE {
            log::error!("buddy: request of {} bytes needs order {}", size, order);
            return Err(Fatal::OrderTooLarge(order).into());
        }
        Ok(order)
    }

    /// Allocate the smallest block covering `size` bytes.
    pub fn alloc(&self, size: usize) -> Result<PhysAddr> {
        self.alloc_order(Self::order_for(size)?)
    }

    /// Allocate one page
    pub fn alloc_frame(&self) -> Result<PhysAddr> {
        self.alloc_order(0)
    }

    /// Allocate a block and zero it
    pub fn alloc_zeroed(&self, size: usize) -> Result<PhysAddr> {
        let order = Self::order_for(size)?;
        let pa = self.alloc_order(order)?;
        for page in 0..(1usize << order) {
            // Freshly allocated, so exclusively ours.
            unsafe { zero_page(pa.add(page * PAGE_SIZE)) };
        }
        Ok(pa)
    }

    /// Allocate a block of exactly `2^order` pages.
    ///
    /// The block head comes back with refcount 1.
    pub fn alloc_order(&self, order: usize) -> Result<PhysAddr> {
        if order > MAX_ORDER {
            return Err(Fatal::OrderTooLarge(order).into());
        }
        let mut st = self.state.lock();
        let Some(found) = (order..=MAX_ORDER).find(|&o| st.free_lists[o] != NIL) else {
            log::error!("buddy: no free block for order {}", order);
            return Err(Fatal::OutOfFrames.into());
        };
        let Some(idx) = st.pop(found) else {
            return Err(Fatal::OutOfFrames.into());
        };
        st.split(idx, found, order);

        let frame = &mut st.frames[idx];
        frame.order = order as u8;
        frame.flags = FrameFlags::HEAD;
        frame.refcount = 1;
        st.free_frames -= 1 << order;
        st.stats.allocations += 1;
        Ok(self.addr_of(idx))
    }

    /// Return a block to the free pool.
    ///
    /// `pa` must be the head of an allocated block that no other owner still
    /// references.
    pub fn free(&self, pa: PhysAddr) -> Result<()> {
        let idx = self.index_of(pa)?;
        let mut st = self.state.lock();
        let frame = st.frames[idx];
        if !frame.flags.contains(FrameFlags::HEAD) || frame.refcount > 1 {
            log::error!("buddy: bad free of {:#x} (flags {:?}, refs {})", pa, frame.flags, frame.refcount);
            return Err(Fatal::BadFree(pa).into());
        }
        self.release_block(&mut st, idx);
        Ok(())
    }

    fn release_block(&self, st: &mut BuddyState, idx: usize) {
        let order = st.frames[idx].order as usize;
        let frame = &mut st.frames[idx];
        frame.flags.remove(FrameFlags::HEAD);
        frame.refcount = 0;
        st.free_frames += 1 << order;
        st.stats.frees += 1;
        st.coalesce(idx, order);

        #[cfg(feature = "debug_subsystems")]
        debug_assert!(st.check(), "buddy free lists inconsistent after free");
    }

    /// Add an owner to an allocated frame
    pub fn acquire(&self, pa: PhysAddr) -> Result<u32> {
        let idx = self.index_of(pa)?;
        let mut st = self.state.lock();
        let frame = &mut st.frames[idx];
        if !frame.flags.contains(FrameFlags::HEAD) || frame.refcount == 0 {
            return Err(Fatal::BadFrame(pa).into());
        }
        frame.refcount += 1;
        Ok(frame.refcount)
    }

    /// Drop an owner; frees the block when the last owner goes away.
    ///
    /// Returns whether the block was freed.
    pub fn release(&self, pa: PhysAddr) -> Result<bool> {
        let idx = self.index_of(pa)?;
        let mut st = self.state.lock();
        let frame = &mut st.frames[idx];
        if !frame.flags.contains(FrameFlags::HEAD) {
            return Err(Fatal::BadFree(pa).into());
        }
        if frame.refcount == 0 {
            return Err(Fatal::RefcountUnderflow(pa).into());
        }
        frame.refcount -= 1;
        if frame.refcount > 0 {
            return Ok(false);
        }
        self.release_block(&mut st, idx);
        Ok(true)
    }

    /// Current owner count, 0 for frames that are not allocated heads
    pub fn refcount(&self, pa: PhysAddr) -> u32 {
        let Ok(idx) = self.index_of(pa.page_round_down()) else {
            return 0;
        };
        let st = self.state.lock();
        let frame = &st.frames[idx];
        if frame.flags.contains(FrameFlags::HEAD) { frame.refcount } else { 0 }
    }

    /// Head of the allocated block containing `pa`
    pub fn block_head(&self, pa: PhysAddr) -> Option<PhysAddr> {
        let idx = self.index_of(pa.page_round_down()).ok()?;
        let st = self.state.lock();
        st.head_of(idx).map(|head| self.addr_of(head))
    }

    /// Order of the allocated block headed at `pa`
    pub fn order_of(&self, pa: PhysAddr) -> Option<usize> {
        let idx = self.index_of(pa).ok()?;
        let st = self.state.lock();
        let frame = &st.frames[idx];
        frame.flags.contains(FrameFlags::HEAD).then_some(frame.order as usize)
    }

    /// Whether `pa` lies in the managed range
    pub fn contains(&self, pa: PhysAddr) -> bool {
        pa.0 >= self.base && pa.0 < self.end()
    }

    /// First managed byte
    pub fn base(&self) -> usize {
        self.base
    }

    /// One past the last managed byte
    pub fn end(&self) -> usize {
        self.base + self.nframes * PAGE_SIZE
    }

    /// Frames under management
    pub fn total_frames(&self) -> usize {
        self.nframes
    }

    /// Frames currently on free lists
    pub fn free_frames(&self) -> usize {
        self.state.lock().free_frames
    }

    /// Number of free blocks listed at `order`
    pub fn free_blocks(&self, order: usize) -> usize {
        let st = self.state.lock();
        let mut count = 0;
        let mut cur = st.free_lists[order];
        while cur != NIL {
            count += 1;
            cur = st.frames[cur as usize].next;
        }
        count
    }

    /// Allocator statistics
    pub fn stats(&self) -> BuddyStats {
        self.state.lock().stats
    }

    /// Verify that the free lists partition exactly the free frames.
    pub fn check_invariants(&self) -> bool {
        self.state.lock().check()
    }

    fn index_of(&self, pa: PhysAddr) -> Result<usize> {
        if !self.contains(pa) || !pa.is_page_aligned() {
            return Err(MmError::Fatal(Fatal::BadFrame(pa)));
        }
        Ok((pa.0 - self.base) >> PAGE_SHIFT)
    }

    fn addr_of(&self, idx: usize) -> PhysAddr {
        PhysAddr(self.base + (idx << PAGE_SHIFT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Arena;

    #[test]
    fn test_initial_blocks() {
        let arena = Arena::new(2048 + 3);
        let frames = arena.frames();
        assert_eq!(frames.free_blocks(MAX_ORDER), 2);
        assert_eq!(frames.free_blocks(1), 1);
        assert_eq!(frames.free_blocks(0), 1);
        assert_eq!(frames.free_frames(), 2051);
        assert!(frames.check_invariants());
    }

    #[test]
    fn test_split_and_merge() {
        let arena = Arena::new(1024);
        let frames = arena.frames();

        let a = frames.alloc_frame().unwrap();
        // One max block split all the way down: one free block per lower order.
        for order in 0..MAX_ORDER {
            assert_eq!(frames.free_blocks(order), 1, "order {}", order);
        }
        assert_eq!(frames.free_blocks(MAX_ORDER), 0);
        assert_eq!(frames.stats().splits, MAX_ORDER as u64);

        frames.free(a).unwrap();
        assert_eq!(frames.free_blocks(MAX_ORDER), 1);
        assert_eq!(frames.free_frames(), 1024);
        assert_eq!(frames.stats().merges, MAX_ORDER as u64);
    }

    #[test]
    fn test_buddies_merge_in_either_order() {
        for swap in [false, true] {
            let arena = Arena::new(2);
            let frames = arena.frames();
            let a = frames.alloc_frame().unwrap();
            let b = frames.alloc_frame().unwrap();
            assert_eq!(b.0, a.0 + PAGE_SIZE);
            let (first, second) = if swap { (b, a) } else { (a, b) };
            frames.free(first).unwrap();
            assert_eq!(frames.free_blocks(0), 1);
            frames.free(second).unwrap();
            assert_eq!(frames.free_blocks(0), 0);
            assert_eq!(frames.free_blocks(1), 1);
        }
    }

    #[test]
    fn test_no_merge_with_split_buddy() {
        let arena = Arena::new(4);
        let frames = arena.frames();
        let low = frames.alloc_order(1).unwrap();
        let a = frames.alloc_frame().unwrap();
        let _b = frames.alloc_frame().unwrap();
        frames.free(a).unwrap();
        // Buddy of `low` is the order-1 block holding a/b; it is half allocated.
        frames.free(low).unwrap();
        assert_eq!(frames.free_blocks(1), 1);
        assert_eq!(frames.free_blocks(0), 1);
        assert!(frames.check_invariants());
    }

    #[test]
    fn test_double_free_is_fatal() {
        let arena = Arena::new(8);
        let frames = arena.frames();
        let a = frames.alloc_frame().unwrap();
        frames.free(a).unwrap();
        assert_eq!(frames.free(a), Err(MmError::Fatal(Fatal::BadFree(a))));
        assert_eq!(frames.free_frames(), 8);
    }

    #[test]
    fn test_exhaustion_and_oversize_are_fatal() {
        let arena = Arena::new(4);
        let frames = arena.frames();
        assert_eq!(frames.alloc(PAGE_SIZE << (MAX_ORDER + 1)), Err(MmError::Fatal(Fatal::OrderTooLarge(MAX_ORDER + 1))));
        let _all = frames.alloc(4 * PAGE_SIZE).unwrap();
        assert_eq!(frames.alloc_frame(), Err(MmError::Fatal(Fatal::OutOfFrames)));
    }

    #[test]
    fn test_order_for() {
        assert_eq!(FrameAllocator::order_for(0).unwrap(), 0);
        assert_eq!(FrameAllocator::order_for(PAGE_SIZE).unwrap(), 0);
        assert_eq!(FrameAllocator::order_for(PAGE_SIZE + 1).unwrap(), 1);
        assert_eq!(FrameAllocator::order_for(3 * PAGE_SIZE).unwrap(), 2);
        assert_eq!(FrameAllocator::order_for(PAGE_SIZE << MAX_ORDER).unwrap(), MAX_ORDER);
    }

    #[test]
    fn test_refcount_release_frees_on_last_owner() {
        let arena = Arena::new(8);
        let frames = arena.frames();
        let pa = frames.alloc_frame().unwrap();
        assert_eq!(frames.acquire(pa).unwrap(), 2);
        assert_eq!(frames.free(pa), Err(MmError::Fatal(Fatal::BadFree(pa))));
        assert!(!frames.release(pa).unwrap());
        assert_eq!(frames.refcount(pa), 1);
        assert!(frames.release(pa).unwrap());
        assert_eq!(frames.refcount(pa), 0);
        assert_eq!(frames.free_frames(), 8);
        assert_eq!(frames.release(pa), Err(MmError::Fatal(Fatal::BadFree(pa))));
    }

    #[test]
    fn test_block_head_walks_back() {
        let arena = Arena::new(16);
        let frames = arena.frames();
        let block = frames.alloc_order(2).unwrap();
        let inner = PhysAddr(block.0 + 3 * PAGE_SIZE + 17);
        assert_eq!(frames.block_head(inner), Some(block));
        frames.free(block).unwrap();
        assert_eq!(frames.block_head(inner), None);
    }

    #[test]
    fn test_foreign_address_rejected() {
        let arena = Arena::new(4);
        let frames = arena.frames();
        let outside = PhysAddr(frames.end());
        assert_eq!(frames.free(outside), Err(MmError::Fatal(Fatal::BadFrame(outside))));
        assert!(!frames.contains(outside));
    }
}
