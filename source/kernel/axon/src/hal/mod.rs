// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware abstraction layer traits.
//!
//! Kernel logic talks to the machine only through these traits so host
//! tests can substitute recording mocks.

pub mod virt;

use crate::task::Context;

/// Abstraction for the supervisor timer.
pub trait Timer {
    /// Returns the current value of the `time` counter.
    fn now(&self) -> u64;
    /// Programs the next timer interrupt at absolute counter value `deadline`.
    fn set_wakeup(&self, deadline: u64);
}

/// Blocking byte sink used for console output.
pub trait Uart {
    /// Writes a single byte.
    fn write_byte(&self, byte: u8);
}

/// TLB management operations.
pub trait Tlb {
    /// Flushes the entire translation cache.
    fn flush_all(&self);
}

/// Address-translation control.
pub trait Paging {
    /// Installs `satp` as the active translation root.
    fn write_satp(&self, satp: usize);
}

/// Execution-context primitives of the single hart.
pub trait Hart {
    /// Saves the callee-saved state of the caller into `save` and resumes `load`.
    ///
    /// Returns when some other context switches back to `save`.
    ///
    /// # Safety
    ///
    /// `load` must hold a context produced by a previous switch or by
    /// [`Context::launch`] on a live stack; both pointers must be valid for
    /// the duration of the call.
    unsafe fn switch(&self, save: *mut Context, load: *const Context);

    /// Enables supervisor interrupts.
    fn intr_on(&self);

    /// Disables supervisor interrupts.
    fn intr_off(&self);

    /// Whether supervisor interrupts are currently enabled.
    fn intr_enabled(&self) -> bool;

    /// Idles until the next interrupt.
    fn wait_for_interrupt(&self);
}
