//! Slab allocator for fixed-size kernel objects
//!
//! A slab is one buddy block laid out as
//!
//! ```text
//! +-------------+---------------------+---------+-----------------------+
//! | SlabHeader  | next-free index [n] | padding | object 0 .. object n-1 |
//! +-------------+---------------------+---------+-----------------------+
//! ```
//!
//! Free objects form a list threaded through the index array: entry `i` holds
//! the index of the next free object after `i`, and [`SLAB_END`] terminates
//! the chain. No bookkeeping memory is allocated beyond the slab itself.
//!
//! Slabs with at least one free object sit on the cache's `partial` list;
//! exhausted slabs sit on `full`. The slab that owns an object is found from
//! the object's address by walking back to the head frame of its buddy block.

extern crate alloc;

use alloc::sync::Arc;
use core::marker::PhantomData;
use core::mem;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::allocator::buddy::FrameAllocator;
use crate::config::MAX_ORDER;
use crate::error::{Fatal, MmError, Result};
use crate::physical::{PAGE_SIZE, PhysAddr};
use crate::sync::IrqMutex;

/// Terminator of a slab's free-index chain
pub const SLAB_END: u32 = u32::MAX;

static NEXT_CACHE_ID: AtomicU32 = AtomicU32::new(1);

/// Header placed at the start of every slab block
#[repr(C)]
struct SlabHeader {
    next: *mut SlabHeader,
    owner: u32,
    in_use: u32,
    free_head: u32,
}

const HEADER_SIZE: usize = mem::size_of::<SlabHeader>();
const INDEX_SIZE: usize = mem::size_of::<u32>();

#[inline]
const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// How a cache lays out its slabs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabGeometry {
    /// Buddy order of each slab
    pub order: usize,
    /// Object size after alignment
    pub object_size: usize,
    /// Object alignment
    pub align: usize,
    /// Objects per slab
    pub capacity: usize,
    /// Byte offset of object 0 from the slab start
    pub objects_offset: usize,
}

impl SlabGeometry {
    /// Pick the smallest order that fits at least one object, then pack as
    /// many objects into it as the header and index array leave room for.
    pub fn compute(size: usize, align: usize) -> Result<Self> {
        if size == 0 || !align.is_power_of_two() || align > PAGE_SIZE {
            return Err(MmError::InvalidArgument);
        }
        let object_size = align_up(size, align);
        for order in 0..=MAX_ORDER {
            let block = PAGE_SIZE << order;
            let mut capacity = block.saturating_sub(HEADER_SIZE) / (INDEX_SIZE + object_size);
            while capacity > 0 && Self::span(capacity, object_size, align) > block {
                capacity -= 1;
            }
            if capacity > 0 {
                let capacity = capacity.min(SLAB_END as usize - 1);
                return Ok(Self {
                    order,
                    object_size,
                    align,
                    capacity,
                    objects_offset: align_up(HEADER_SIZE + capacity * INDEX_SIZE, align),
                });
            }
        }
        Err(MmError::ObjectTooLarge)
    }

    const fn span(capacity: usize, object_size: usize, align: usize) -> usize {
        align_up(HEADER_SIZE + capacity * INDEX_SIZE, align) + capacity * object_size
    }

    /// Bytes in one slab
    pub const fn slab_bytes(&self) -> usize {
        PAGE_SIZE << self.order
    }
}

/// Slab cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlabStats {
    /// Slabs on the partial list
    pub partial: usize,
    /// Slabs on the full list
    pub full: usize,
    /// Objects handed out and not yet freed
    pub in_use: usize,
}

struct SlabLists {
    partial: *mut SlabHeader,
    full: *mut SlabHeader,
    in_use: usize,
}

impl SlabLists {
    fn push(head: &mut *mut SlabHeader, slab: *mut SlabHeader) {
        unsafe { (*slab).next = *head };
        *head = slab;
    }

    /// Unlink `slab` from the list at `head`; false if it is not there.
    fn remove(head: &mut *mut SlabHeader, slab: *mut SlabHeader) -> bool {
        let mut link: *mut *mut SlabHeader = head;
        unsafe {
            while !(*link).is_null() {
                if *link == slab {
                    *link = (*slab).next;
                    (*slab).next = ptr::null_mut();
                    return true;
                }
                link = &mut (**link).next;
            }
        }
        false
    }

    fn contains(head: *mut SlabHeader, slab: *mut SlabHeader) -> bool {
        let mut cur = head;
        while !cur.is_null() {
            if cur == slab {
                return true;
            }
            cur = unsafe { (*cur).next };
        }
        false
    }

    fn len(head: *mut SlabHeader) -> usize {
        let mut n = 0;
        let mut cur = head;
        while !cur.is_null() {
            n += 1;
            cur = unsafe { (*cur).next };
        }
        n
    }
}

/// A pool of equally sized objects carved from buddy blocks
pub struct SlabCache {
    name: &'static str,
    id: u32,
    geometry: SlabGeometry,
    frames: Arc<FrameAllocator>,
    lists: IrqMutex<SlabLists>,
}

// Slab headers are only reached through `lists`, which is locked.
unsafe impl Send for SlabCache {}
unsafe impl Sync for SlabCache {}

impl SlabCache {
    /// Create a cache for objects of `size` bytes aligned to `align`.
    pub fn create(name: &'static str, size: usize, align: usize, frames: Arc<FrameAllocator>) -> Result<Self> {
        let geometry = SlabGeometry::compute(size, align)?;
        log::debug!(
            "slab: cache {} object {} bytes, order {}, {} per slab",
            name,
            geometry.object_size,
            geometry.order,
            geometry.capacity
        );
        Ok(Self {
            name,
            id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
            geometry,
            frames,
            lists: IrqMutex::new(SlabLists {
                partial: ptr::null_mut(),
                full: ptr::null_mut(),
                in_use: 0,
            }),
        })
    }

    /// Cache name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Slab layout
    pub fn geometry(&self) -> SlabGeometry {
        self.geometry
    }

    /// Allocate one object.
    ///
    /// Running out of frames while growing the cache is reported as
    /// [`MmError::NoMemory`].
    pub fn alloc(&self) -> Result<NonNull<u8>> {
        let mut lists = self.lists.lock();
        if lists.partial.is_null() {
            let slab = self.grow()?;
            SlabLists::push(&mut lists.partial, slab);
        }

        let slab = lists.partial;
        let idx = unsafe {
            let idx = (*slab).free_head;
            (*slab).free_head = *self.index_slot(slab, idx as usize);
            (*slab).in_use += 1;
            idx as usize
        };
        if unsafe { (*slab).free_head } == SLAB_END {
            SlabLists::remove(&mut lists.partial, slab);
            SlabLists::push(&mut lists.full, slab);
        }
        lists.in_use += 1;

        let obj = slab as usize + self.geometry.objects_offset + idx * self.geometry.object_size;
        NonNull::new(obj as *mut u8).ok_or(MmError::NoMemory)
    }

    /// Return an object to the slab it came from.
    pub fn free(&self, obj: NonNull<u8>) -> Result<()> {
        self.free_with(obj, || ())
    }

    /// Validate `obj`, run `take` on it while it is still live, then put it
    /// back on its slab's free list. Nothing runs if validation fails.
    fn free_with<R>(&self, obj: NonNull<u8>, take: impl FnOnce() -> R) -> Result<R> {
        let addr = obj.as_ptr() as usize;
        let mut lists = self.lists.lock();

        let corrupted = || {
            log::error!("slab: cache {} cannot free {:#x}", self.name, addr);
            MmError::Fatal(Fatal::SlabCorrupted(addr))
        };

        let head = self.frames.block_head(PhysAddr(addr)).ok_or_else(corrupted)?;
        let slab = head.0 as *mut SlabHeader;
        let in_full = SlabLists::contains(lists.full, slab);
        if !in_full && !SlabLists::contains(lists.partial, slab) {
            return Err(corrupted());
        }

        let first = head.0 + self.geometry.objects_offset;
        if addr < first || (addr - first) % self.geometry.object_size != 0 {
            return Err(corrupted());
        }
        let idx = (addr - first) / self.geometry.object_size;
        if idx >= self.geometry.capacity || unsafe { (*slab).owner } != self.id || self.is_free(slab, idx) {
            return Err(corrupted());
        }

        let taken = take();
        unsafe {
            *self.index_slot(slab, idx) = (*slab).free_head;
            (*slab).free_head = idx as u32;
            (*slab).in_use -= 1;
        }
        if in_full {
            SlabLists::remove(&mut lists.full, slab);
            SlabLists::push(&mut lists.partial, slab);
        }
        lists.in_use -= 1;
        Ok(taken)
    }

    /// Give slabs with no live objects back to the frame allocator.
    ///
    /// Returns the number of slabs released.
    pub fn shrink(&self) -> Result<usize> {
        let mut lists = self.lists.lock();
        let mut released = 0;
        let mut cur = lists.partial;
        while !cur.is_null() {
            let next = unsafe { (*cur).next };
            if unsafe { (*cur).in_use } == 0 {
                SlabLists::remove(&mut lists.partial, cur);
                self.frames.free(PhysAddr(cur as usize))?;
                released += 1;
            }
            cur = next;
        }
        if released > 0 {
            log::debug!("slab: cache {} released {} slabs", self.name, released);
        }
        Ok(released)
    }

    /// Release every slab. Fails while objects are still allocated.
    pub fn destroy(&self) -> Result<()> {
        if self.lists.lock().in_use > 0 {
            return Err(MmError::Busy);
        }
        self.shrink().map(|_| ())
    }

    /// Current list lengths and live object count
    pub fn stats(&self) -> SlabStats {
        let lists = self.lists.lock();
        SlabStats {
            partial: SlabLists::len(lists.partial),
            full: SlabLists::len(lists.full),
            in_use: lists.in_use,
        }
    }

    fn grow(&self) -> Result<*mut SlabHeader> {
        let block = self
            .frames
            .alloc_order(self.geometry.order)
            .map_err(MmError::recoverable_oom)?;
        let slab = block.0 as *mut SlabHeader;
        unsafe {
            slab.write(SlabHeader {
                next: ptr::null_mut(),
                owner: self.id,
                in_use: 0,
                free_head: 0,
            });
            for i in 0..self.geometry.capacity {
                let next = if i + 1 == self.geometry.capacity { SLAB_END } else { (i + 1) as u32 };
                *self.index_slot(slab, i) = next;
            }
        }
        log::trace!("slab: cache {} new slab at {:#x}", self.name, block);
        Ok(slab)
    }

    fn index_slot(&self, slab: *mut SlabHeader, idx: usize) -> *mut u32 {
        (slab as usize + HEADER_SIZE + idx * INDEX_SIZE) as *mut u32
    }

    fn is_free(&self, slab: *mut SlabHeader, idx: usize) -> bool {
        let mut cur = unsafe { (*slab).free_head };
        let mut steps = 0;
        while cur != SLAB_END && steps <= self.geometry.capacity {
            if cur as usize == idx {
                return true;
            }
            cur = unsafe { *self.index_slot(slab, cur as usize) };
            steps += 1;
        }
        false
    }
}

impl Drop for SlabCache {
    fn drop(&mut self) {
        let in_use = self.lists.lock().in_use;
        if in_use > 0 {
            log::warn!("slab: cache {} dropped with {} live objects", self.name, in_use);
        }
        if let Err(e) = self.shrink() {
            log::error!("slab: cache {} teardown failed: {}", self.name, e);
        }
    }
}

/// Typed front end over a [`SlabCache`]
pub struct ObjectCache<T> {
    cache: SlabCache,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T> ObjectCache<T> {
    /// Cache sized and aligned for `T`
    pub fn new(name: &'static str, frames: Arc<FrameAllocator>) -> Result<Self> {
        let cache = SlabCache::create(name, mem::size_of::<T>().max(1), mem::align_of::<T>(), frames)?;
        Ok(Self {
            cache,
            _marker: PhantomData,
        })
    }

    /// Move `value` into a fresh slab object
    pub fn alloc(&self, value: T) -> Result<NonNull<T>> {
        let obj = self.cache.alloc()?.cast::<T>();
        unsafe { obj.as_ptr().write(value) };
        Ok(obj)
    }

    /// Move the value out and return its slot to the cache.
    ///
    /// # Safety
    /// `obj` must come from [`ObjectCache::alloc`] on this cache and must not
    /// be used afterwards.
    pub unsafe fn free(&self, obj: NonNull<T>) -> Result<T> {
        self.cache.free_with(obj.cast(), || unsafe { obj.as_ptr().read() })
    }

    /// Underlying untyped cache
    pub fn raw(&self) -> &SlabCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Arena;
    use alloc::vec::Vec;

    #[test]
    fn test_geometry_small_objects() {
        let g = SlabGeometry::compute(64, 8).unwrap();
        assert_eq!(g.order, 0);
        assert_eq!(g.object_size, 64);
        assert_eq!(g.capacity, 59);
        assert!(g.objects_offset % 8 == 0);
        assert!(g.objects_offset + g.capacity * g.object_size <= PAGE_SIZE);
        // One more object would not fit.
        assert!(SlabGeometry::span(g.capacity + 1, 64, 8) > PAGE_SIZE);
    }

    #[test]
    fn test_geometry_picks_larger_order() {
        let g = SlabGeometry::compute(5000, 16).unwrap();
        assert_eq!(g.order, 1);
        assert_eq!(g.capacity, 1);
        assert_eq!(g.object_size, 5008);
    }

    #[test]
    fn test_geometry_rejects_bad_input() {
        assert_eq!(SlabGeometry::compute(0, 8), Err(MmError::InvalidArgument));
        assert_eq!(SlabGeometry::compute(8, 3), Err(MmError::InvalidArgument));
        assert_eq!(SlabGeometry::compute(PAGE_SIZE << MAX_ORDER, 8), Err(MmError::ObjectTooLarge));
    }

    #[test]
    fn test_full_and_partial_migration() {
        let arena = Arena::new(64);
        let cache = SlabCache::create("test-64", 64, 8, arena.frames().clone()).unwrap();
        let cap = cache.geometry().capacity;

        let objs: Vec<_> = (0..cap).map(|_| cache.alloc().unwrap()).collect();
        assert_eq!(cache.stats(), SlabStats { partial: 0, full: 1, in_use: cap });

        cache.free(objs[3]).unwrap();
        assert_eq!(cache.stats(), SlabStats { partial: 1, full: 0, in_use: cap - 1 });

        // The freed slot is handed out again before a new slab is created.
        let again = cache.alloc().unwrap();
        assert_eq!(again, objs[3]);
        let extra = cache.alloc().unwrap();
        assert_eq!(cache.stats(), SlabStats { partial: 1, full: 1, in_use: cap + 1 });

        cache.free(extra).unwrap();
        for obj in objs {
            cache.free(obj).unwrap();
        }
        assert_eq!(cache.stats().in_use, 0);
        assert_eq!(cache.shrink().unwrap(), 2);
        assert_eq!(arena.frames().free_frames(), 64);
    }

    #[test]
    fn test_alloc_free_roundtrip_preserves_lists() {
        let arena = Arena::new(16);
        let cache = SlabCache::create("rt", 40, 8, arena.frames().clone()).unwrap();
        let keep = cache.alloc().unwrap();
        let before = cache.stats();
        let obj = cache.alloc().unwrap();
        cache.free(obj).unwrap();
        assert_eq!(cache.stats(), before);
        cache.free(keep).unwrap();
    }

    #[test]
    fn test_objects_are_aligned_and_distinct() {
        let arena = Arena::new(16);
        let cache = SlabCache::create("align", 24, 32, arena.frames().clone()).unwrap();
        let a = cache.alloc().unwrap().as_ptr() as usize;
        let b = cache.alloc().unwrap().as_ptr() as usize;
        assert_eq!(a % 32, 0);
        assert_eq!(b % 32, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_double_free_is_fatal() {
        let arena = Arena::new(16);
        let cache = SlabCache::create("df", 32, 8, arena.frames().clone()).unwrap();
        let obj = cache.alloc().unwrap();
        let _other = cache.alloc().unwrap();
        cache.free(obj).unwrap();
        assert!(matches!(cache.free(obj), Err(MmError::Fatal(Fatal::SlabCorrupted(_)))));
    }

    #[test]
    fn test_foreign_block_is_fatal() {
        let arena = Arena::new(16);
        let cache = SlabCache::create("foreign", 32, 8, arena.frames().clone()).unwrap();
        let block = arena.frames().alloc_frame().unwrap();
        let ptr = NonNull::new((block.0 + 512) as *mut u8).unwrap();
        assert!(matches!(cache.free(ptr), Err(MmError::Fatal(Fatal::SlabCorrupted(_)))));
    }

    #[test]
    fn test_misaligned_object_is_fatal() {
        let arena = Arena::new(16);
        let cache = SlabCache::create("mis", 32, 8, arena.frames().clone()).unwrap();
        let obj = cache.alloc().unwrap();
        let inside = NonNull::new((obj.as_ptr() as usize + 4) as *mut u8).unwrap();
        assert!(matches!(cache.free(inside), Err(MmError::Fatal(Fatal::SlabCorrupted(_)))));
    }

    #[test]
    fn test_grow_reports_no_memory() {
        let arena = Arena::new(1);
        let cache = SlabCache::create("oom", 2048, 8, arena.frames().clone()).unwrap();
        let _hog = arena.frames().alloc_frame().unwrap();
        assert_eq!(cache.alloc(), Err(MmError::NoMemory));
    }

    #[test]
    fn test_destroy_requires_no_live_objects() {
        let arena = Arena::new(16);
        let cache = SlabCache::create("busy", 128, 8, arena.frames().clone()).unwrap();
        let obj = cache.alloc().unwrap();
        assert_eq!(cache.destroy(), Err(MmError::Busy));
        cache.free(obj).unwrap();
        cache.destroy().unwrap();
        assert_eq!(arena.frames().free_frames(), 16);
    }

    #[test]
    fn test_object_cache_moves_values() {
        let arena = Arena::new(16);
        let cache: ObjectCache<(u64, [u8; 20])> = ObjectCache::new("typed", arena.frames().clone()).unwrap();
        let p = cache.alloc((7, [1; 20])).unwrap();
        assert_eq!(unsafe { p.as_ref() }.0, 7);
        let v = unsafe { cache.free(p) }.unwrap();
        assert_eq!(v, (7, [1; 20]));
        assert_eq!(cache.raw().stats().in_use, 0);
    }

    struct Counted(Arc<AtomicU32>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_object_cache_rejects_before_reading() {
        let arena = Arena::new(16);
        let drops = Arc::new(AtomicU32::new(0));
        let cache: ObjectCache<Counted> = ObjectCache::new("counted", arena.frames().clone()).unwrap();
        let p = cache.alloc(Counted(drops.clone())).unwrap();
        let _keep = cache.alloc(Counted(drops.clone())).unwrap();

        drop(unsafe { cache.free(p) }.unwrap());
        assert_eq!(drops.load(Ordering::Relaxed), 1);
        assert_eq!(Arc::strong_count(&drops), 2);

        // A second free must fail without materializing a stale value.
        assert!(matches!(unsafe { cache.free(p) }, Err(MmError::Fatal(Fatal::SlabCorrupted(_)))));
        assert_eq!(drops.load(Ordering::Relaxed), 1);
        assert_eq!(Arc::strong_count(&drops), 2);
        assert_eq!(cache.raw().stats().in_use, 1);
    }
}
