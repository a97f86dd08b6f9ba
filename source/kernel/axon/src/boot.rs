// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Early boot routines for the AXON kernel
//! OWNERS: @kernel-boot-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: No tests (boot path exercised on QEMU)
//! PUBLIC API: early_boot_init()
//! DEPENDS_ON: arch::riscv::clear_bss, heap::init_heap, trap::install_trap_vector
//! INVARIANTS: Single-invocation; interrupts masked; runs before any static is read

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
extern "C" {
    static mut __bss_start: u8;
    static mut __bss_end: u8;
}

/// Perform the machine initialisation required before the kernel can run.
///
/// Must be invoked once on the boot hart, on the boot stack, with
/// interrupts masked.
pub fn early_boot_init() {
    zero_bss();
    crate::heap::init_heap();
    crate::trap::install_trap_vector();
    log_info!(target: "boot", "boot: ok");
}

fn zero_bss() {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: called once before anything in .bss is read.
    unsafe {
        crate::arch::riscv::clear_bss(
            core::ptr::addr_of_mut!(__bss_start),
            core::ptr::addr_of_mut!(__bss_end),
        );
    }
}
