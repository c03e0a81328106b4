//! Memory subsystem configuration
//!
//! Compile-time allocator limits plus the runtime board description handed to
//! the subsystem at boot.

extern crate alloc;

use alloc::vec::Vec;

use crate::error::{MmError, Result};
use crate::page_table::PteFlags;
use crate::physical::PAGE_SIZE;

/// Largest buddy order: blocks of `2^MAX_ORDER` pages (4 MiB)
pub const MAX_ORDER: usize = 10;
/// Number of free lists
pub const ORDER_COUNT: usize = MAX_ORDER + 1;
/// Bytes in a maximum-order block
pub const MAX_BLOCK_SIZE: usize = PAGE_SIZE << MAX_ORDER;

/// What `fork` does with private (non-SHARED) pages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForkPolicy {
    /// Give the child its own physical copy of every populated page
    #[default]
    EagerCopy,
    /// Share pages read-only and copy on the first write fault
    CopyOnWrite,
}

/// One range of the kernel direct map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelSegment {
    /// Virtual start
    pub va: usize,
    /// Physical start
    pub pa: usize,
    /// Length in bytes
    pub size: usize,
    /// Leaf permissions (and cache policy bits for MMIO)
    pub perm: PteFlags,
}

/// Kernel page-table contents
#[derive(Debug, Clone, Default)]
pub struct KernelLayout {
    /// Segments mapped at boot, in order
    pub segments: Vec<KernelSegment>,
}

impl KernelLayout {
    /// QEMU `virt`-compatible board: UART, VIRTIO disk, PLIC, then RAM with
    /// kernel text read-execute and everything after `etext` read-write.
    pub fn board(kernel_base: usize, etext: usize, phys_top: usize) -> Self {
        let io = PteFlags::R | PteFlags::W | PteFlags::IO;
        let segments = alloc::vec![
            KernelSegment { va: UART0, pa: UART0, size: PAGE_SIZE, perm: io },
            KernelSegment { va: VIRTIO0, pa: VIRTIO0, size: PAGE_SIZE, perm: io },
            KernelSegment { va: PLIC, pa: PLIC, size: 0x40_0000, perm: io },
            KernelSegment {
                va: kernel_base,
                pa: kernel_base,
                size: etext - kernel_base,
                perm: PteFlags::R | PteFlags::X,
            },
            KernelSegment {
                va: etext,
                pa: etext,
                size: phys_top - etext,
                perm: PteFlags::R | PteFlags::W,
            },
        ];
        Self { segments }
    }
}

/// UART0 MMIO base
pub const UART0: usize = 0x1000_0000;
/// VIRTIO disk MMIO base
pub const VIRTIO0: usize = 0x1000_1000;
/// Platform-level interrupt controller base
pub const PLIC: usize = 0x0c00_0000;
/// Start of RAM on the board
pub const KERNBASE: usize = 0x8000_0000;

/// Runtime memory configuration
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// First byte of memory handed to the frame allocator
    pub phys_base: usize,
    /// Bytes handed to the frame allocator
    pub phys_size: usize,
    /// Fork behaviour for private pages
    pub fork_policy: ForkPolicy,
    /// Kernel direct map
    pub kernel: KernelLayout,
}

impl MemoryConfig {
    /// Default board: 128 MiB of RAM at `KERNBASE`, the first 8 MiB
    /// reserved for the kernel image.
    pub fn board() -> Self {
        let phys_top = KERNBASE + 128 * 1024 * 1024;
        let image_end = KERNBASE + 8 * 1024 * 1024;
        Self {
            phys_base: image_end,
            phys_size: phys_top - image_end,
            fork_policy: ForkPolicy::default(),
            kernel: KernelLayout::board(KERNBASE, KERNBASE + 0x20_0000, phys_top),
        }
    }

    /// Number of frames the allocator will manage
    pub const fn frame_count(&self) -> usize {
        self.phys_size / PAGE_SIZE
    }

    /// Check alignment and size of the managed range
    pub fn validate(&self) -> Result<()> {
        if self.phys_base % PAGE_SIZE != 0 || self.phys_size % PAGE_SIZE != 0 {
            return Err(MmError::Misaligned);
        }
        if self.phys_size == 0 || self.phys_base.checked_add(self.phys_size).is_none() {
            return Err(MmError::InvalidArgument);
        }
        if self.frame_count() >= u32::MAX as usize {
            return Err(MmError::OutOfRange);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_board_config_is_valid() {
        let cfg = MemoryConfig::board();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.frame_count(), 120 * 256);
        assert_eq!(cfg.fork_policy, ForkPolicy::EagerCopy);
        assert_eq!(cfg.kernel.segments.len(), 5);
    }

    #[test]
    fn test_validate_rejects_misaligned() {
        let mut cfg = MemoryConfig::board();
        cfg.phys_base += 1;
        assert_eq!(cfg.validate(), Err(MmError::Misaligned));
        cfg.phys_base -= 1;
        cfg.phys_size = 0;
        assert_eq!(cfg.validate(), Err(MmError::InvalidArgument));
    }
}
