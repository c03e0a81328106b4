//! Shared helpers for the integration tests

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::sync::Arc;

use rivet_mm::{AddressSpace, ForkPolicy, FrameAllocator, MmContext, PAGE_SIZE};

/// Heap memory standing in for physical RAM
pub struct TestRam {
    base: *mut u8,
    layout: Layout,
    frames: Arc<FrameAllocator>,
}

impl TestRam {
    pub fn new(nframes: usize) -> Self {
        let layout = Layout::from_size_align(nframes * PAGE_SIZE, PAGE_SIZE).unwrap();
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null(), "test RAM allocation failed");
        let frames = unsafe { FrameAllocator::new(base as usize, nframes) };
        Self {
            base,
            layout,
            frames: Arc::new(frames),
        }
    }

    /// RAM sized in MiB
    pub fn mib(n: usize) -> Self {
        Self::new(n * 1024 * 1024 / PAGE_SIZE)
    }

    pub fn frames(&self) -> &Arc<FrameAllocator> {
        &self.frames
    }

    pub fn context(&self, policy: ForkPolicy) -> Arc<MmContext> {
        MmContext::new(self.frames.clone(), policy).unwrap()
    }

    pub fn space(&self, policy: ForkPolicy) -> AddressSpace {
        AddressSpace::new(self.context(policy)).unwrap()
    }
}

impl Drop for TestRam {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) };
    }
}
