//! Page-fault resolution
//!
//! Called by trap dispatch for load, store and instruction page faults on
//! user addresses. Three cases are handled:
//!
//! * a store to a copy-on-write leaf: upgrade in place when this address
//!   space is the frame's only owner, otherwise copy the frame;
//! * an access to an installed leaf that allows it: record `A`/`D`, as
//!   hardware without automatic A/D updates expects;
//! * no leaf: populate one frame from the covering region (file contents or
//!   zeros) or from the lazily grown heap below `brk`.
//!
//! Running out of frames here is fatal: the kernel cannot make progress.

extern crate alloc;

use alloc::sync::Arc;
use core::slice;

use super::file::MappedFile;
use super::region::FaultKind;
use super::{AddressSpace, HEAP_PROT};
use crate::error::{MmError, Result};
use crate::layout::is_user_address;
use crate::page_table::{Pte, PteFlags};
use crate::physical::{PAGE_SIZE, PhysAddr, copy_page, page_round_down, zero_page};

enum Fill {
    Zero,
    File(Arc<dyn MappedFile>, u64),
}

/// Whether an installed leaf allows a user access of `kind`
fn leaf_permits(flags: PteFlags, kind: FaultKind) -> bool {
    flags.contains(PteFlags::U)
        && match kind {
            FaultKind::Load => flags.contains(PteFlags::R),
            FaultKind::Store => flags.contains(PteFlags::W),
            FaultKind::Instruction => flags.contains(PteFlags::X),
        }
}

fn touched(flags: PteFlags, kind: FaultKind) -> PteFlags {
    match kind {
        FaultKind::Store => flags | PteFlags::A | PteFlags::D,
        _ => flags | PteFlags::A,
    }
}

/// Fill the frame at `pa` from `file` starting at `offset`; anything past
/// end of file reads as zero.
fn read_page(file: &dyn MappedFile, pa: PhysAddr, offset: u64) -> Result<()> {
    // The frame was just allocated and is not mapped anywhere yet.
    let page = unsafe { slice::from_raw_parts_mut(pa.as_mut_ptr(), PAGE_SIZE) };
    page.fill(0);
    let mut done = 0;
    while done < PAGE_SIZE {
        let n = file.read_at(&mut page[done..], offset + done as u64)?;
        if n == 0 {
            break;
        }
        done += n;
    }
    Ok(())
}

impl AddressSpace {
    /// Resolve a page fault at `addr`.
    ///
    /// [`MmError::AccessViolation`] means the process touched memory it may
    /// not; any [`MmError::Fatal`] must halt the kernel.
    pub fn handle_fault(&mut self, addr: usize, kind: FaultKind) -> Result<()> {
        if !is_user_address(addr) {
            return Err(MmError::AccessViolation);
        }
        let va = page_round_down(addr);

        if let Some(pte) = self.table.entry(va) {
            let flags = pte.flags();
            if kind == FaultKind::Store && flags.contains(PteFlags::COW) {
                if !flags.contains(PteFlags::COW_WRITE) {
                    return Err(MmError::AccessViolation);
                }
                return self.resolve_cow(va, pte);
            }
            if !leaf_permits(flags, kind) {
                return Err(MmError::AccessViolation);
            }
            let updated = touched(flags, kind);
            if updated != flags {
                self.table.update_leaf(va, |pte| pte.set_flags(updated))?;
            }
            return Ok(());
        }

        let (prot, fill) = match self.regions.find(va) {
            Some(region) => {
                let fill = match &region.file {
                    Some(file) => Fill::File(file.clone(), region.file_offset(va)),
                    None => Fill::Zero,
                };
                (region.prot, fill)
            }
            None if va < self.brk => (HEAP_PROT, Fill::Zero),
            None => return Err(MmError::AccessViolation),
        };
        if !prot.permits(kind) {
            return Err(MmError::AccessViolation);
        }
        self.populate(va, touched(prot.leaf_flags(), kind), fill)
    }

    fn populate(&mut self, va: usize, flags: PteFlags, fill: Fill) -> Result<()> {
        let frame = self.ctx.frames.alloc_frame()?;
        let filled = match &fill {
            Fill::Zero => {
                unsafe { zero_page(frame) };
                Ok(())
            }
            Fill::File(file, offset) => read_page(file.as_ref(), frame, *offset),
        };
        if let Err(e) = filled.and_then(|()| self.table.map(va, PAGE_SIZE, frame, flags)) {
            self.ctx.frames.free(frame)?;
            return Err(e);
        }
        log::trace!("vm: populated {:#x} -> {:#x}", va, frame);
        Ok(())
    }

    fn resolve_cow(&mut self, va: usize, pte: Pte) -> Result<()> {
        let frames = self.ctx.frames.clone();
        let old = pte.pa();
        let flags = touched(pte.flags().without_cow(), FaultKind::Store);

        if frames.refcount(old) == 1 {
            self.table.update_leaf(va, |pte| pte.set_flags(flags))?;
            log::trace!("vm: cow at {:#x} kept sole frame {:#x}", va, old);
            return Ok(());
        }

        let fresh = frames.alloc_frame()?;
        unsafe { copy_page(fresh, old) };
        self.table.update_leaf(va, |pte| *pte = Pte::new(fresh, flags))?;
        frames.release(old)?;
        log::trace!("vm: cow at {:#x} copied {:#x} -> {:#x}", va, old, fresh);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForkPolicy;
    use crate::error::Fatal;
    use crate::layout::MMAP_END;
    use crate::testing::Arena;
    use crate::vm::file::{MemFile, MockMappedFile};
    use crate::vm::region::{MapFlags, Prot};

    #[test]
    fn test_lazy_anonymous_fault() {
        let arena = Arena::new(64);
        let mut space = arena.space(ForkPolicy::EagerCopy);
        let addr = space
            .mmap(0, 4 * PAGE_SIZE, Prot::READ | Prot::WRITE, MapFlags::PRIVATE | MapFlags::ANONYMOUS, None, 0)
            .unwrap();
        assert!(space.translate(addr).is_none());

        space.handle_fault(addr + PAGE_SIZE + 5, FaultKind::Load).unwrap();
        let pte = space.page_table().entry(addr + PAGE_SIZE).unwrap();
        assert!(pte.flags().contains(PteFlags::U | PteFlags::R | PteFlags::W | PteFlags::A));
        assert!(!pte.flags().contains(PteFlags::D));
        assert!(space.translate(addr).is_none());

        space.handle_fault(addr + PAGE_SIZE, FaultKind::Store).unwrap();
        assert!(space.page_table().entry(addr + PAGE_SIZE).unwrap().flags().contains(PteFlags::D));
    }

    #[test]
    fn test_fault_permission_checks() {
        let arena = Arena::new(64);
        let mut space = arena.space(ForkPolicy::EagerCopy);
        let ro = space
            .mmap(0, PAGE_SIZE, Prot::READ, MapFlags::PRIVATE | MapFlags::ANONYMOUS, None, 0)
            .unwrap();
        assert_eq!(space.handle_fault(ro, FaultKind::Store), Err(MmError::AccessViolation));
        assert_eq!(space.handle_fault(ro, FaultKind::Instruction), Err(MmError::AccessViolation));
        space.handle_fault(ro, FaultKind::Load).unwrap();
        assert_eq!(space.handle_fault(ro, FaultKind::Store), Err(MmError::AccessViolation));
        assert_eq!(space.handle_fault(ro + PAGE_SIZE, FaultKind::Load), Err(MmError::AccessViolation));
        assert_eq!(space.handle_fault(MMAP_END, FaultKind::Load), Err(MmError::AccessViolation));
    }

    #[test]
    fn test_file_fault_zero_fills_past_eof() {
        let arena = Arena::new(64);
        let mut space = arena.space(ForkPolicy::EagerCopy);
        let mut data = alloc::vec![0xaa; PAGE_SIZE + 100];
        data[PAGE_SIZE] = 0x55;
        let file = Arc::new(MemFile::with_contents(data));
        let addr = space
            .mmap(0, 2 * PAGE_SIZE, Prot::READ, MapFlags::PRIVATE, Some(file), 0)
            .unwrap();

        let mut buf = [0u8; 4];
        space.copy_in(addr + PAGE_SIZE - 2, &mut buf).unwrap();
        assert_eq!(buf, [0xaa, 0xaa, 0x55, 0xaa]);
        space.copy_in(addr + PAGE_SIZE + 98, &mut buf).unwrap();
        assert_eq!(buf, [0xaa, 0xaa, 0, 0]);
    }

    #[test]
    fn test_file_fault_uses_region_offset() {
        let arena = Arena::new(64);
        let mut space = arena.space(ForkPolicy::EagerCopy);
        let mut file = MockMappedFile::new();
        file.expect_writable().return_const(true);
        file.expect_size().return_const(3 * PAGE_SIZE as u64);
        file.expect_read_at()
            .withf(|buf, offset| buf.len() == PAGE_SIZE && *offset == 2 * PAGE_SIZE as u64)
            .times(1)
            .returning(|buf, _| {
                buf.fill(3);
                Ok(buf.len())
            });
        let addr = space
            .mmap(0, PAGE_SIZE, Prot::READ, MapFlags::PRIVATE, Some(Arc::new(file)), 2 * PAGE_SIZE as u64)
            .unwrap();
        let mut b = [0u8];
        space.copy_in(addr + 7, &mut b).unwrap();
        assert_eq!(b, [3]);
    }

    #[test]
    fn test_file_read_error_releases_frame() {
        let arena = Arena::new(64);
        let mut space = arena.space(ForkPolicy::EagerCopy);
        let mut file = MockMappedFile::new();
        file.expect_writable().return_const(false);
        file.expect_read_at().returning(|_, _| Err(MmError::Io));
        let addr = space
            .mmap(0, PAGE_SIZE, Prot::READ, MapFlags::PRIVATE, Some(Arc::new(file)), 0)
            .unwrap();
        let free = arena.frames().free_frames();
        assert_eq!(space.handle_fault(addr, FaultKind::Load), Err(MmError::Io));
        assert_eq!(arena.frames().free_frames(), free);
        assert!(space.translate(addr).is_none());
    }

    #[test]
    fn test_cow_copy_and_upgrade() {
        let arena = Arena::new(128);
        let frames = arena.frames().clone();
        let mut parent = arena.space(ForkPolicy::CopyOnWrite);
        parent.alloc_image(PAGE_SIZE, Prot::READ | Prot::WRITE).unwrap();
        parent.copy_out(0, b"orig").unwrap();

        let mut child = parent.fork().unwrap();
        let shared = parent.translate(0).unwrap();
        assert_eq!(child.translate(0), Some(shared));
        assert_eq!(frames.refcount(shared), 2);

        // Shared frame: the writer gets a private copy.
        child.handle_fault(0, FaultKind::Store).unwrap();
        let copy = child.translate(0).unwrap();
        assert_ne!(copy, shared);
        assert_eq!(frames.refcount(shared), 1);
        assert_eq!(frames.refcount(copy), 1);
        let flags = child.page_table().entry(0).unwrap().flags();
        assert!(flags.contains(PteFlags::W) && !flags.contains(PteFlags::COW));

        // Sole owner now: upgraded in place.
        parent.handle_fault(0, FaultKind::Store).unwrap();
        assert_eq!(parent.translate(0), Some(shared));
        assert!(parent.page_table().entry(0).unwrap().flags().contains(PteFlags::W));

        let mut buf = [0u8; 4];
        child.copy_in(0, &mut buf).unwrap();
        assert_eq!(&buf, b"orig");
    }

    #[test]
    fn test_cow_store_after_mprotect_is_violation() {
        let arena = Arena::new(128);
        let mut parent = arena.space(ForkPolicy::CopyOnWrite);
        let a = parent
            .mmap(0, PAGE_SIZE, Prot::READ | Prot::WRITE, MapFlags::PRIVATE | MapFlags::ANONYMOUS, None, 0)
            .unwrap();
        parent.copy_out(a, b"z").unwrap();
        let mut child = parent.fork().unwrap();

        child.mprotect(a, PAGE_SIZE, Prot::READ).unwrap();
        let flags = child.page_table().entry(a).unwrap().flags();
        assert!(flags.contains(PteFlags::COW) && !flags.contains(PteFlags::COW_WRITE));
        assert_eq!(child.handle_fault(a, FaultKind::Store), Err(MmError::AccessViolation));

        child.mprotect(a, PAGE_SIZE, Prot::READ | Prot::WRITE).unwrap();
        child.handle_fault(a, FaultKind::Store).unwrap();
        assert_ne!(child.translate(a), parent.translate(a));
    }

    #[test]
    fn test_mprotect_after_cow_fork_of_readonly_page() {
        let arena = Arena::new(128);
        let frames = arena.frames().clone();
        let mut parent = arena.space(ForkPolicy::CopyOnWrite);
        let a = parent
            .mmap(0, PAGE_SIZE, Prot::READ, MapFlags::PRIVATE | MapFlags::ANONYMOUS, None, 0)
            .unwrap();
        parent.handle_fault(a, FaultKind::Load).unwrap();
        let mut child = parent.fork().unwrap();
        let shared = parent.translate(a).unwrap();
        assert_eq!(frames.refcount(shared), 2);

        parent.mprotect(a, PAGE_SIZE, Prot::READ | Prot::WRITE).unwrap();
        let flags = parent.page_table().entry(a).unwrap().flags();
        assert!(!flags.contains(PteFlags::W));
        assert!(flags.contains(PteFlags::COW | PteFlags::COW_WRITE));

        parent.copy_out(a, b"mine").unwrap();
        assert_ne!(parent.translate(a), Some(shared));
        assert_eq!(frames.refcount(shared), 1);

        let mut buf = [0xffu8; 4];
        child.copy_in(a, &mut buf).unwrap();
        assert_eq!(buf, [0; 4]);
        assert_eq!(child.copy_out(a, b"nope"), Err(MmError::AccessViolation));
    }

    #[test]
    fn test_fault_exhaustion_is_fatal() {
        let arena = Arena::new(8);
        let mut space = arena.space(ForkPolicy::EagerCopy);
        space.sbrk(64 * PAGE_SIZE as isize).unwrap();
        let mut result = Ok(());
        for page in 0..64 {
            result = space.handle_fault(page * PAGE_SIZE, FaultKind::Store);
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result, Err(MmError::Fatal(Fatal::OutOfFrames)));
    }
}
