//! Backing files for mappings
//!
//! The file layer lives outside this crate; mappings only need positional
//! reads and writes plus the file's size and write permission.

extern crate alloc;

use alloc::vec::Vec;

use crate::error::{MmError, Result};

/// File interface used by fault resolution and write-back
#[cfg_attr(test, mockall::automock)]
pub trait MappedFile: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`, returning the count read.
    /// Reads at or past the end return 0.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write `buf` at `offset`, returning the count written
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize>;

    /// Current length in bytes
    fn size(&self) -> u64;

    /// Whether the handle was opened for writing
    fn writable(&self) -> bool;
}

/// An anonymous in-memory file, in the spirit of `memfd_create`
pub struct MemFile {
    data: spin::Mutex<Vec<u8>>,
    writable: bool,
}

impl MemFile {
    /// Zero-filled writable file of `size` bytes
    pub fn new(size: usize) -> Self {
        Self::with_contents(alloc::vec![0; size])
    }

    /// Writable file holding `data`
    pub fn with_contents(data: Vec<u8>) -> Self {
        Self {
            data: spin::Mutex::new(data),
            writable: true,
        }
    }

    /// Same file opened read-only
    pub fn read_only(self) -> Self {
        Self {
            writable: false,
            ..self
        }
    }

    /// Snapshot of the file contents
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl MappedFile for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let data = self.data.lock();
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        if !self.writable {
            return Err(MmError::BadFile);
        }
        let start = usize::try_from(offset).map_err(|_| MmError::Io)?;
        let end = start.checked_add(buf.len()).ok_or(MmError::Io)?;
        let mut data = self.data.lock();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn size(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn writable(&self) -> bool {
        self.writable
    }
}
