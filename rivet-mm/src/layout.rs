//! User address-space layout
//!
//! The Sv39 user half is laid out xv6-style, with an mmap window carved out
//! between the program break and the trap pages:
//!
//! ```text
//! MAXVA       +------------------+
//!             | trampoline       |
//! TRAPFRAME   | trapframe        |
//! MMAP_END    +------------------+  <- fork copies everything below here
//!             | mmap regions     |
//! MMAP_BASE   +------------------+
//!             | heap (brk grows) |
//!             | text/data/stack  |
//! 0           +------------------+
//! ```

use crate::physical::PAGE_SIZE;

/// One beyond the highest virtual address. Sv39 allows 39 bits but the top bit
/// is kept clear so addresses never need sign extension.
pub const MAXVA: usize = 1 << (9 + 9 + 9 + 12 - 1);

/// Trampoline page, mapped in every address space
pub const TRAMPOLINE: usize = MAXVA - PAGE_SIZE;

/// Per-process trap frame page
pub const TRAPFRAME: usize = TRAMPOLINE - PAGE_SIZE;

/// Upper bound (exclusive) of the mmap window and of fork-time copying
pub const MMAP_END: usize = TRAPFRAME;

/// Lower bound of the mmap window; the program break may not cross it
pub const MMAP_BASE: usize = 1 << 37;

/// Largest single mapping the window can hold
pub const MMAP_MAX_LEN: usize = MMAP_END - MMAP_BASE;

/// Check if an address lies in the user half below the trap pages
#[inline]
pub const fn is_user_address(addr: usize) -> bool {
    addr < MMAP_END
}

/// Whether `[start, start + len)` lies inside the mmap window
#[inline]
pub const fn in_mmap_window(start: usize, len: usize) -> bool {
    start >= MMAP_BASE && len <= MMAP_MAX_LEN && start <= MMAP_END - len
}
