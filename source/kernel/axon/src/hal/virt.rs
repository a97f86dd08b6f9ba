// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! HAL implementation targeting QEMU's `virt` machine.

use crate::arch::riscv;
use crate::task::Context;
use crate::uart::KernelUart;

use super::{Hart, Paging, Timer, Tlb, Uart};

/// Collection of HAL devices for the virt machine.
pub struct VirtMachine {
    timer: VirtTimer,
    uart: VirtUart,
    tlb: VirtTlb,
    mmu: VirtMmu,
    hart: VirtHart,
}

impl VirtMachine {
    /// Constructs the HAL facade.
    pub const fn new() -> Self {
        Self { timer: VirtTimer, uart: VirtUart, tlb: VirtTlb, mmu: VirtMmu, hart: VirtHart }
    }

    pub const fn timer(&self) -> &VirtTimer {
        &self.timer
    }

    pub const fn uart(&self) -> &VirtUart {
        &self.uart
    }

    pub const fn tlb(&self) -> &VirtTlb {
        &self.tlb
    }

    pub const fn mmu(&self) -> &VirtMmu {
        &self.mmu
    }

    pub const fn hart(&self) -> &VirtHart {
        &self.hart
    }
}

impl Default for VirtMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Supervisor timer: `time` CSR plus SBI `set_timer`.
pub struct VirtTimer;

impl Timer for VirtTimer {
    fn now(&self) -> u64 {
        riscv::read_time()
    }

    fn set_wakeup(&self, deadline: u64) {
        riscv::set_timer(deadline);
    }
}

/// Console UART routed through the locked kernel writer.
pub struct VirtUart;

impl Uart for VirtUart {
    fn write_byte(&self, byte: u8) {
        KernelUart::lock().putc(byte);
    }
}

/// Sv39 TLB helper issuing `sfence.vma` when compiled for RISC-V.
pub struct VirtTlb;

impl Tlb for VirtTlb {
    fn flush_all(&self) {
        riscv::sfence_vma_all();
    }
}

/// SATP writer.
pub struct VirtMmu;

impl Paging for VirtMmu {
    fn write_satp(&self, satp: usize) {
        riscv::write_satp(satp);
    }
}

/// The single hart: context switch and `sstatus.SIE`.
pub struct VirtHart;

impl Hart for VirtHart {
    unsafe fn switch(&self, save: *mut Context, load: *const Context) {
        // SAFETY: forwarded caller contract.
        unsafe { riscv::switch(save, load) }
    }

    fn intr_on(&self) {
        riscv::intr_on();
    }

    fn intr_off(&self) {
        riscv::intr_off();
    }

    fn intr_enabled(&self) -> bool {
        riscv::intr_enabled()
    }

    fn wait_for_interrupt(&self) {
        riscv::wait_for_interrupt();
    }
}
