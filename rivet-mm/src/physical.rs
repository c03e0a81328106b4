//! Physical address helpers
//!
//! Page constants, page rounding and the [`PhysAddr`] newtype used by the
//! frame allocator and the page-table code.

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;
/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

/// Align address down to page boundary
#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Align address up to page boundary
#[inline]
pub const fn page_round_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Number of pages needed to cover `len` bytes
#[inline]
pub const fn pages_for(len: usize) -> usize {
    page_round_up(len) >> PAGE_SHIFT
}

/// A physical address
///
/// The kernel runs with physical memory identity mapped, so a `PhysAddr`
/// handed out by the frame allocator is also directly dereferenceable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(pub usize);

impl PhysAddr {
    /// Creates a new physical address from a raw usize value.
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the physical address as a raw usize value.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the offset within the current page.
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Checks if the physical address is page-aligned.
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Rounds down the physical address to the previous page boundary.
    pub const fn page_round_down(self) -> Self {
        Self(page_round_down(self.0))
    }

    /// Returns the address `bytes` further on.
    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    /// Raw byte pointer to the frame contents.
    pub const fn as_mut_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }
}

impl From<usize> for PhysAddr {
    fn from(addr: usize) -> Self {
        Self(addr)
    }
}

impl From<PhysAddr> for usize {
    fn from(addr: PhysAddr) -> Self {
        addr.0
    }
}

impl core::fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Zero one page of physical memory.
///
/// # Safety
/// `pa` must be a page owned by the caller.
pub unsafe fn zero_page(pa: PhysAddr) {
    unsafe { core::ptr::write_bytes(pa.as_mut_ptr(), 0, PAGE_SIZE) }
}

/// Copy one page of physical memory.
///
/// # Safety
/// Both pages must be valid and must not overlap.
pub unsafe fn copy_page(dst: PhysAddr, src: PhysAddr) {
    unsafe { core::ptr::copy_nonoverlapping(src.as_mut_ptr() as *const u8, dst.as_mut_ptr(), PAGE_SIZE) }
}
