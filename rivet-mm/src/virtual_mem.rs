//! Virtual address helpers for Sv39

use crate::layout::MAXVA;
use crate::physical::{PAGE_SHIFT, PAGE_SIZE, page_round_down, page_round_up};

/// Bits of virtual page number consumed per table level
pub const PX_BITS: usize = 9;
/// Mask for a single level index
pub const PX_MASK: usize = (1 << PX_BITS) - 1;
/// Number of translation levels
pub const LEVELS: usize = 3;

/// A virtual address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct VirtAddr(pub usize);

impl VirtAddr {
    /// Creates a new virtual address from a raw usize value.
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the virtual address as a raw usize value.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the offset within the current page.
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Checks if the virtual address is page-aligned.
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Rounds up the virtual address to the next page boundary.
    pub const fn page_round_up(self) -> Self {
        Self(page_round_up(self.0))
    }

    /// Rounds down the virtual address to the previous page boundary.
    pub const fn page_round_down(self) -> Self {
        Self(page_round_down(self.0))
    }

    /// Index into the table at `level` (2 = root, 0 = leaf table).
    pub const fn px(self, level: usize) -> usize {
        (self.0 >> (PAGE_SHIFT + PX_BITS * level)) & PX_MASK
    }

    /// Whether the address is translatable at all.
    pub const fn is_valid(self) -> bool {
        self.0 < MAXVA
    }
}

impl From<usize> for VirtAddr {
    fn from(addr: usize) -> Self {
        Self(addr)
    }
}
