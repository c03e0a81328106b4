//! Copying between kernel buffers and user memory
//!
//! Each user page is resolved through [`AddressSpace::handle_fault`] first, so
//! copies populate lazy pages and break copy-on-write exactly as a user access
//! would. A copy that hits an inaccessible page fails with
//! [`MmError::AccessViolation`] after the bytes before it were copied.

use core::ptr;

use super::AddressSpace;
use super::region::FaultKind;
use crate::error::{MmError, Result};
use crate::physical::{PAGE_SIZE, PhysAddr};

impl AddressSpace {
    /// Copy `src` to user address `dst`.
    pub fn copy_out(&mut self, dst: usize, src: &[u8]) -> Result<()> {
        let mut copied = 0;
        while copied < src.len() {
            let va = dst.checked_add(copied).ok_or(MmError::AccessViolation)?;
            let chunk = (src.len() - copied).min(PAGE_SIZE - va % PAGE_SIZE);
            let pa = self.user_page(va, FaultKind::Store)?;
            unsafe { ptr::copy_nonoverlapping(src[copied..].as_ptr(), pa.as_mut_ptr(), chunk) };
            copied += chunk;
        }
        Ok(())
    }

    /// Fill `dst` from user address `src`.
    pub fn copy_in(&mut self, src: usize, dst: &mut [u8]) -> Result<()> {
        let mut copied = 0;
        while copied < dst.len() {
            let va = src.checked_add(copied).ok_or(MmError::AccessViolation)?;
            let chunk = (dst.len() - copied).min(PAGE_SIZE - va % PAGE_SIZE);
            let pa = self.user_page(va, FaultKind::Load)?;
            unsafe { ptr::copy_nonoverlapping(pa.as_mut_ptr().cast_const(), dst[copied..].as_mut_ptr(), chunk) };
            copied += chunk;
        }
        Ok(())
    }

    /// Copy a NUL-terminated string from user address `src` into `dst`,
    /// returning its length without the terminator.
    ///
    /// Fails with [`MmError::InvalidArgument`] if no terminator fits in `dst`.
    pub fn copy_in_str(&mut self, src: usize, dst: &mut [u8]) -> Result<usize> {
        let mut copied = 0;
        while copied < dst.len() {
            let va = src.checked_add(copied).ok_or(MmError::AccessViolation)?;
            let chunk = (dst.len() - copied).min(PAGE_SIZE - va % PAGE_SIZE);
            let pa = self.user_page(va, FaultKind::Load)?;
            let bytes = unsafe { core::slice::from_raw_parts(pa.as_mut_ptr().cast_const(), chunk) };
            match bytes.iter().position(|&b| b == 0) {
                Some(nul) => {
                    dst[copied..copied + nul + 1].copy_from_slice(&bytes[..=nul]);
                    return Ok(copied + nul);
                }
                None => dst[copied..copied + chunk].copy_from_slice(bytes),
            }
            copied += chunk;
        }
        Err(MmError::InvalidArgument)
    }

    /// Kernel address of the byte at user address `va`, faulting it in for
    /// an access of `kind`
    fn user_page(&mut self, va: usize, kind: FaultKind) -> Result<PhysAddr> {
        self.handle_fault(va, kind)?;
        self.table.lookup(va).ok_or(MmError::AccessViolation)
    }
}
