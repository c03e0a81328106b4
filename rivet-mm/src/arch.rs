// RISC-V supervisor CSR access used by the memory subsystem.
// On any other target these are no-ops so the crate can be exercised on a host.

#[cfg(target_arch = "riscv64")]
use core::arch::asm;

/// Disable interrupts and return previous state
#[inline]
pub fn intr_off() -> bool {
    #[cfg(target_arch = "riscv64")]
    {
        let sstatus: usize;
        unsafe {
            asm!("csrrc {}, sstatus, {}", out(reg) sstatus, const 0x2);
        }
        (sstatus & 0x2) != 0
    }

    #[cfg(not(target_arch = "riscv64"))]
    {
        false
    }
}

/// Enable interrupts
#[inline]
pub fn intr_on() {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        asm!("csrsi sstatus, 0x2");
    }
}

/// Flush the TLB entry for one virtual page
#[inline]
pub fn sfence_vma_page(va: usize) {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        asm!("sfence.vma {}, zero", in(reg) va);
    }

    #[cfg(not(target_arch = "riscv64"))]
    let _ = va;
}

/// Flush the whole TLB
#[inline]
pub fn sfence_vma_all() {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        asm!("sfence.vma zero, zero");
    }
}

/// Install a new root page table.
///
/// # Safety
/// `satp` must describe a page table that maps the currently executing code.
#[inline]
pub unsafe fn write_satp(satp: usize) {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        sfence_vma_all();
        asm!("csrw satp, {}", in(reg) satp);
        sfence_vma_all();
    }

    #[cfg(not(target_arch = "riscv64"))]
    let _ = satp;
}
