//! Memory subsystem error definitions
//!
//! Caller misuse (bad alignment, an overlapping fixed mapping, bad flags) is
//! returned to the syscall layer without touching kernel state. So is
//! resource exhaustion at an API boundary (`NoMemory`, `NoSpace`). Corruption
//! or exhaustion the kernel cannot recover from is wrapped in
//! [`MmError::Fatal`] and is expected to end in [`halt`].

use core::fmt;

use crate::physical::PhysAddr;

/// Result alias used throughout the crate
pub type Result<T> = core::result::Result<T, MmError>;

/// Memory error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    /// Malformed or unsupported argument
    InvalidArgument,
    /// Address or offset not page aligned
    Misaligned,
    /// Address beyond the translatable or user range
    OutOfRange,
    /// Fixed mapping collides with an existing region
    Overlap,
    /// No free range in the mmap window
    NoSpace,
    /// A recoverable allocation failed (slab growth, region record, fork)
    NoMemory,
    /// Protection not allowed by the backing file
    PermissionDenied,
    /// File-backed mapping without a usable file
    BadFile,
    /// Fault on an address with no mapping or insufficient protection
    AccessViolation,
    /// Object too large for any slab order
    ObjectTooLarge,
    /// Resource still in use
    Busy,
    /// Backing file I/O failed
    Io,
    /// Unrecoverable condition, the kernel must halt
    Fatal(Fatal),
}

/// Unrecoverable conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fatal {
    /// No free block of any order
    OutOfFrames,
    /// Request larger than the maximum buddy order
    OrderTooLarge(usize),
    /// Free of a frame that is not a live block head
    BadFree(PhysAddr),
    /// Physical address outside the managed range
    BadFrame(PhysAddr),
    /// Refcount dropped below zero
    RefcountUnderflow(PhysAddr),
    /// Map over an already valid leaf
    Remap(usize),
    /// A table entry where a leaf was expected
    NotLeaf(usize),
    /// Leaf still present while freeing table pages
    LeafInTeardown(PhysAddr),
    /// Slab bookkeeping does not match the object being freed
    SlabCorrupted(usize),
}

impl MmError {
    /// Whether this error must halt the kernel
    pub const fn is_fatal(&self) -> bool {
        matches!(self, MmError::Fatal(_))
    }

    /// Negative errno for the syscall layer, `None` for fatal errors
    pub const fn errno(&self) -> Option<isize> {
        let code = match self {
            MmError::InvalidArgument
            | MmError::Misaligned
            | MmError::OutOfRange
            | MmError::Overlap
            | MmError::ObjectTooLarge => errno::EINVAL,
            MmError::NoSpace | MmError::NoMemory => errno::ENOMEM,
            MmError::PermissionDenied => errno::EACCES,
            MmError::BadFile => errno::EBADF,
            MmError::AccessViolation => errno::EFAULT,
            MmError::Busy => errno::EBUSY,
            MmError::Io => errno::EIO,
            MmError::Fatal(_) => return None,
        };
        Some(-code)
    }

    /// Treat frame exhaustion as a recoverable allocation failure.
    ///
    /// Used at API boundaries (slab growth, fork, eager image growth) where
    /// running out of frames is reported to the caller instead of halting.
    pub const fn recoverable_oom(self) -> Self {
        match self {
            MmError::Fatal(Fatal::OutOfFrames) => MmError::NoMemory,
            other => other,
        }
    }
}

impl From<Fatal> for MmError {
    fn from(f: Fatal) -> Self {
        MmError::Fatal(f)
    }
}

impl fmt::Display for MmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MmError::InvalidArgument => write!(f, "invalid argument"),
            MmError::Misaligned => write!(f, "address not page aligned"),
            MmError::OutOfRange => write!(f, "address out of range"),
            MmError::Overlap => write!(f, "range overlaps an existing mapping"),
            MmError::NoSpace => write!(f, "no free virtual range"),
            MmError::NoMemory => write!(f, "out of memory"),
            MmError::PermissionDenied => write!(f, "permission denied"),
            MmError::BadFile => write!(f, "bad backing file"),
            MmError::AccessViolation => write!(f, "access violation"),
            MmError::ObjectTooLarge => write!(f, "object too large for slab"),
            MmError::Busy => write!(f, "resource busy"),
            MmError::Io => write!(f, "I/O error"),
            MmError::Fatal(fatal) => write!(f, "fatal: {}", fatal),
        }
    }
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fatal::OutOfFrames => write!(f, "out of physical frames"),
            Fatal::OrderTooLarge(order) => write!(f, "block order {} exceeds maximum", order),
            Fatal::BadFree(pa) => write!(f, "bad free of frame {:#x}", pa),
            Fatal::BadFrame(pa) => write!(f, "frame {:#x} outside managed memory", pa),
            Fatal::RefcountUnderflow(pa) => write!(f, "refcount underflow on {:#x}", pa),
            Fatal::Remap(va) => write!(f, "remap of valid leaf at {:#x}", va),
            Fatal::NotLeaf(va) => write!(f, "non-leaf entry at {:#x}", va),
            Fatal::LeafInTeardown(pa) => write!(f, "leaf left in table page {:#x}", pa),
            Fatal::SlabCorrupted(addr) => write!(f, "slab corruption freeing {:#x}", addr),
        }
    }
}

/// Stop the kernel after an unrecoverable memory error.
#[cold]
pub fn halt(fatal: Fatal) -> ! {
    log::error!("mm: {}", fatal);
    panic!("mm: {}", fatal)
}

/// POSIX error numbers returned by the syscall adapters
pub mod errno {
    pub const EIO: isize = 5;
    pub const EBADF: isize = 9;
    pub const ENOMEM: isize = 12;
    pub const EACCES: isize = 13;
    pub const EFAULT: isize = 14;
    pub const EBUSY: isize = 16;
    pub const EINVAL: isize = 22;
}
