//! Syscall entry points for the memory calls
//!
//! Arguments arrive as raw register values and results leave as `isize`:
//! an address or zero on success, a negative errno on failure. Unknown flag
//! bits are rejected with `-EINVAL` before anything is looked at. A fatal
//! error never turns into an errno; it halts the kernel here.

extern crate alloc;

use alloc::sync::Arc;

use super::file::MappedFile;
use super::mmap::{MremapFlags, MsyncFlags};
use super::region::{FaultKind, MapFlags, Prot};
use super::AddressSpace;
use crate::error::{self, MmError, Result};

/// Resolves a file descriptor to the file it refers to
pub type FdLookup<'a> = &'a dyn Fn(i32) -> Option<Arc<dyn MappedFile>>;

fn extract_args<const N: usize>(args: &[u64]) -> Result<[u64; N]> {
    args.get(..N)
        .and_then(|a| a.try_into().ok())
        .ok_or(MmError::InvalidArgument)
}

fn finish(result: Result<usize>) -> isize {
    match result {
        Ok(value) => value as isize,
        Err(MmError::Fatal(fatal)) => error::halt(fatal),
        Err(e) => {
            log::trace!("vm: syscall failed: {}", e);
            e.errno().unwrap_or(-error::errno::EINVAL)
        }
    }
}

fn prot_from(bits: u64) -> Result<Prot> {
    u32::try_from(bits)
        .ok()
        .and_then(Prot::from_bits)
        .ok_or(MmError::InvalidArgument)
}

/// `mmap(addr, length, prot, flags, fd, offset)`
pub fn sys_mmap(space: &mut AddressSpace, args: &[u64], files: FdLookup<'_>) -> isize {
    finish((|| {
        let [addr, len, prot, flags, fd, offset] = extract_args::<6>(args)?;
        let prot = prot_from(prot)?;
        let flags = u32::try_from(flags)
            .ok()
            .and_then(MapFlags::from_bits)
            .ok_or(MmError::InvalidArgument)?;
        let file = if flags.contains(MapFlags::ANONYMOUS) {
            None
        } else {
            Some(files(fd as i32).ok_or(MmError::BadFile)?)
        };
        space.mmap(addr as usize, len as usize, prot, flags, file, offset)
    })())
}

/// `munmap(addr, length)`
pub fn sys_munmap(space: &mut AddressSpace, args: &[u64]) -> isize {
    finish((|| {
        let [addr, len] = extract_args::<2>(args)?;
        space.munmap(addr as usize, len as usize).map(|()| 0)
    })())
}

/// `mprotect(addr, length, prot)`
pub fn sys_mprotect(space: &mut AddressSpace, args: &[u64]) -> isize {
    finish((|| {
        let [addr, len, prot] = extract_args::<3>(args)?;
        space.mprotect(addr as usize, len as usize, prot_from(prot)?).map(|()| 0)
    })())
}

/// `msync(addr, length, flags)`
pub fn sys_msync(space: &mut AddressSpace, args: &[u64]) -> isize {
    finish((|| {
        let [addr, len, flags] = extract_args::<3>(args)?;
        let flags = u32::try_from(flags)
            .ok()
            .and_then(MsyncFlags::from_bits)
            .ok_or(MmError::InvalidArgument)?;
        space.msync(addr as usize, len as usize, flags).map(|()| 0)
    })())
}

/// `mremap(old_addr, old_length, new_length, flags)`
pub fn sys_mremap(space: &mut AddressSpace, args: &[u64]) -> isize {
    finish((|| {
        let [old, old_len, new_len, flags] = extract_args::<4>(args)?;
        let flags = u32::try_from(flags)
            .ok()
            .and_then(MremapFlags::from_bits)
            .ok_or(MmError::InvalidArgument)?;
        space.mremap(old as usize, old_len as usize, new_len as usize, flags)
    })())
}

/// `sbrk(increment)`, returning the previous break
pub fn sys_sbrk(space: &mut AddressSpace, args: &[u64]) -> isize {
    finish((|| {
        let [delta] = extract_args::<1>(args)?;
        space.sbrk(delta as i64 as isize)
    })())
}

/// Page-fault entry for trap dispatch. Returns `false` when the process
/// must be killed for the access.
pub fn user_fault(space: &mut AddressSpace, addr: usize, kind: FaultKind) -> bool {
    match space.handle_fault(addr, kind) {
        Ok(()) => true,
        Err(MmError::Fatal(fatal)) => error::halt(fatal),
        Err(e) => {
            log::debug!("vm: {:?} fault at {:#x} rejected: {}", kind, addr, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForkPolicy;
    use crate::error::errno::{EBADF, EINVAL, ENOMEM};
    use crate::layout::MMAP_BASE;
    use crate::physical::PAGE_SIZE;
    use crate::testing::Arena;
    use crate::vm::file::MemFile;

    const RW: u64 = 3;
    const PRIVATE_ANON: u64 = 0x22;

    fn no_files(_: i32) -> Option<Arc<dyn MappedFile>> {
        None
    }

    #[test]
    fn test_sys_mmap_roundtrip() {
        let arena = Arena::new(64);
        let mut space = arena.space(ForkPolicy::EagerCopy);
        let addr = sys_mmap(&mut space, &[0, 8192, RW, PRIVATE_ANON, u64::MAX, 0], &no_files);
        assert_eq!(addr, MMAP_BASE as isize);
        assert!(user_fault(&mut space, addr as usize, FaultKind::Store));
        assert_eq!(sys_mprotect(&mut space, &[addr as u64, 8192, 1]), 0);
        assert!(!user_fault(&mut space, addr as usize, FaultKind::Store));
        assert_eq!(sys_munmap(&mut space, &[addr as u64, 8192]), 0);
        assert!(space.regions().is_empty());
    }

    #[test]
    fn test_sys_errors() {
        let arena = Arena::new(64);
        let mut space = arena.space(ForkPolicy::EagerCopy);
        assert_eq!(sys_mmap(&mut space, &[0, 4096, RW, 0x40_0022, 0, 0], &no_files), -EINVAL);
        assert_eq!(sys_mmap(&mut space, &[0, 4096, 8, PRIVATE_ANON, 0, 0], &no_files), -EINVAL);
        assert_eq!(sys_mmap(&mut space, &[0, 4096, RW, 0x02, 3, 0], &no_files), -EBADF);
        assert_eq!(sys_mmap(&mut space, &[0, 4096], &no_files), -EINVAL);
        assert_eq!(sys_munmap(&mut space, &[1, 4096]), -EINVAL);
        assert_eq!(sys_msync(&mut space, &[MMAP_BASE as u64, 4096, 4]), -ENOMEM);
        assert_eq!(sys_mremap(&mut space, &[MMAP_BASE as u64, 4096, 8192, 2]), -EINVAL);
    }

    #[test]
    fn test_sys_mmap_file_and_sbrk() {
        let arena = Arena::new(64);
        let mut space = arena.space(ForkPolicy::EagerCopy);
        let file: Arc<dyn MappedFile> = Arc::new(MemFile::with_contents(b"mapped".to_vec()));
        let files = |fd: i32| (fd == 3).then(|| file.clone());
        let addr = sys_mmap(&mut space, &[0, 4096, 1, 0x02, 3, 0], &files);
        assert!(addr > 0);
        let mut buf = [0u8; 6];
        space.copy_in(addr as usize, &mut buf).unwrap();
        assert_eq!(&buf, b"mapped");

        assert_eq!(sys_sbrk(&mut space, &[PAGE_SIZE as u64]), 0);
        assert_eq!(sys_sbrk(&mut space, &[(-(PAGE_SIZE as i64)) as u64]), PAGE_SIZE as isize);
        assert_eq!(space.brk(), 0);
    }
}
