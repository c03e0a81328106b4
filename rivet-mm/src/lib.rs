//! Rivet Memory Management
//!
//! Physical and virtual memory for a single-hart RISC-V kernel:
//!
//! * [`allocator::buddy`] hands out power-of-two runs of 4 KiB frames and
//!   counts references on them;
//! * [`allocator::slab`] carves frames into fixed-size kernel objects;
//! * [`page_table`] manages Sv39 three-level tables;
//! * [`vm`] keeps per-process mmap regions and resolves page faults lazily,
//!   with copy-on-write and write-back of shared file mappings.
//!
//! The crate is `no_std` and needs only `alloc`. Under `cfg(test)` it builds
//! against std and fakes physical memory with a page-aligned heap arena.

#![cfg_attr(not(test), no_std)]
#![warn(clippy::all)]

extern crate alloc;

use alloc::sync::Arc;

pub mod allocator;
pub mod arch;
pub mod config;
pub mod error;
pub mod layout;
pub mod page_table;
pub mod physical;
pub mod sync;
pub mod virtual_mem;
pub mod vm;

pub use allocator::{FrameAllocator, ObjectCache, SlabCache};
pub use config::{ForkPolicy, MemoryConfig};
pub use error::{Fatal, MmError, Result};
pub use page_table::{PageTableRoot, Pte, PteFlags};
pub use physical::{PAGE_SHIFT, PAGE_SIZE, PhysAddr, page_round_down, page_round_up};
pub use virtual_mem::VirtAddr;
pub use vm::{AddressSpace, FaultKind, MapFlags, MappedFile, MmContext, Prot};

static MM: spin::Once<Arc<MmContext>> = spin::Once::new();

/// Bring up the frame allocator and shared caches for the whole kernel.
///
/// # Safety
/// The configured physical range must be unused RAM, identity mapped, and
/// must stay reserved for this allocator for the rest of the kernel's life.
pub unsafe fn init_global(config: &MemoryConfig) -> Result<&'static Arc<MmContext>> {
    if MM.is_completed() {
        return Err(MmError::Busy);
    }
    config.validate()?;
    let ctx = unsafe { MmContext::from_config(config)? };
    log::info!(
        "mm: {} frames at {:#x}, fork policy {:?}",
        ctx.frames().total_frames(),
        config.phys_base,
        config.fork_policy
    );
    Ok(MM.call_once(|| ctx))
}

/// The context set up by [`init_global`]
pub fn global() -> Option<&'static Arc<MmContext>> {
    MM.get()
}
