// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! RISC-V specific helpers used across the AXON kernel.
//!
//! The implementation follows the Sv39 privileged specification and is
//! written such that host builds can still exercise high level logic via
//! the lightweight `#[cfg(not(...))]` stubs.

use crate::task::Context;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
core::arch::global_asm!(
    include_str!("switch.S"),
    CTX_RA = const 0,
    CTX_SP = const 8,
    CTX_S0 = const 16,
);

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
extern "C" {
    fn __axon_switch(save: *mut Context, load: *const Context);
}

static_assertions::const_assert_eq!(core::mem::size_of::<Context>(), 14 * 8);

/// Clears the `.bss` region defined by the linker.
#[inline]
pub fn clear_bss(start: *mut u8, end: *mut u8) {
    let len = end as usize - start as usize;
    // SAFETY: the linker guarantees [start, end) is the writable bss of this image.
    unsafe { core::ptr::write_bytes(start, 0, len) };
}

/// Swaps execution contexts; see [`crate::hal::Hart::switch`].
///
/// # Safety
///
/// Both pointers must reference live contexts; `load` must resume on a valid stack.
#[inline]
pub unsafe fn switch(save: *mut Context, load: *const Context) {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: forwarded caller contract.
    unsafe {
        __axon_switch(save, load)
    };
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = (save, load);
        log_error!(target: "arch", "context switch is unavailable on the host");
    }
}

/// Installs the supervisor trap vector in direct mode.
#[inline]
pub fn install_trap_vector(vector: usize) {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: privileged context during boot; `vector` is 4-byte aligned code.
    unsafe {
        ::riscv::register::stvec::write(vector, ::riscv::register::mtvec::TrapMode::Direct);
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = vector;
    }
}

/// Enables the supervisor timer interrupt source (`sie.STIE`).
#[inline]
pub fn enable_timer_interrupts() {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: the trap vector is installed before this is called.
    unsafe {
        ::riscv::register::sie::set_stimer();
    }
}

/// Sets `sstatus.SIE`.
#[inline]
pub fn intr_on() {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: single hart; the trap vector is installed.
    unsafe {
        ::riscv::register::sstatus::set_sie();
    }
}

/// Clears `sstatus.SIE`.
#[inline]
pub fn intr_off() {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: masking interrupts is always sound.
    unsafe {
        ::riscv::register::sstatus::clear_sie();
    }
}

#[inline]
pub fn intr_enabled() -> bool {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        ::riscv::register::sstatus::read().sie()
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        false
    }
}

/// Reads the `time` CSR (10 MHz on QEMU `virt`).
#[inline]
pub fn read_time() -> u64 {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        ::riscv::register::time::read() as u64
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        0
    }
}

/// Programs the next supervisor timer interrupt through the SBI.
#[inline]
pub fn set_timer(deadline: u64) {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let _ = sbi_rt::set_timer(deadline);
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = deadline;
    }
}

/// Writes the `satp` CSR. The caller flushes the TLB afterwards.
#[inline]
pub fn write_satp(satp: usize) {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: the new root identity-maps the code currently executing.
    unsafe {
        core::arch::asm!("csrw satp, {0}", in(reg) satp, options(nostack));
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = satp;
    }
}

/// Flushes all TLB entries.
#[inline]
pub fn sfence_vma_all() {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: fence has no memory-safety preconditions.
    unsafe {
        core::arch::asm!("sfence.vma x0, x0", options(nostack));
    }
}

/// Issues a WFI instruction or spins on the host.
#[inline]
pub fn wait_for_interrupt() {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: wfi only stalls the hart.
    unsafe {
        core::arch::asm!("wfi", options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        core::hint::spin_loop();
    }
}
