// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Memory layout constants and runtime scheduling knobs
//! OWNERS: @kernel-team
//! PUBLIC API: layout constants, tick_interval(), set_tick_interval(), preempt_period(), set_preempt_period()
//! DEPENDS_ON: core::sync::atomic
//! INVARIANTS: Relaxed atomics sufficient (single hart); defaults stable across boots
//!
//! The layout matches QEMU's `virt` machine with 128 MiB of RAM. The top
//! `STACK_WINDOW_SIZE` bytes of RAM hold the boot stack and are never handed
//! to the page allocator.

use core::sync::atomic::{AtomicU64, Ordering};

/// Start of RAM and of the kernel image.
pub const KERNBASE: usize = 0x8000_0000;
/// End of usable physical memory.
pub const PHYSTOP: usize = 0x8800_0000;
/// Size of the reserved top-of-memory stack window.
pub const STACK_WINDOW_SIZE: usize = 0x40_0000;
/// First byte of the reserved stack window.
pub const STACK_WINDOW_BASE: usize = PHYSTOP - STACK_WINDOW_SIZE;
/// Physical address of the 16550 UART.
pub const UART0_BASE: usize = 0x1000_0000;

/// Capacity of the process table.
pub const NPROC: usize = 8;

/// Kernel heap backing the file store.
pub const HEAP_SIZE: usize = 512 * 1024;

const DEFAULT_TICK_CYCLES: u64 = 1_000_000;
const DEFAULT_PREEMPT_PERIOD: u64 = 5;

static TICK_CYCLES: AtomicU64 = AtomicU64::new(DEFAULT_TICK_CYCLES);
static PREEMPT_PERIOD: AtomicU64 = AtomicU64::new(DEFAULT_PREEMPT_PERIOD);

/// Timer interval between supervisor timer interrupts, in `time` CSR cycles.
#[inline]
pub fn tick_interval() -> u64 {
    TICK_CYCLES.load(Ordering::Relaxed)
}

/// Overrides the timer interval. Zero is clamped to one cycle.
#[inline]
pub fn set_tick_interval(cycles: u64) {
    TICK_CYCLES.store(cycles.max(1), Ordering::Relaxed);
}

/// Every `preempt_period()`-th tick forces the running process back to the scheduler.
#[inline]
pub fn preempt_period() -> u64 {
    PREEMPT_PERIOD.load(Ordering::Relaxed)
}

/// Overrides the preemption period. Zero is clamped to one tick.
#[inline]
pub fn set_preempt_period(ticks: u64) {
    PREEMPT_PERIOD.store(ticks.max(1), Ordering::Relaxed);
}

static_assertions::const_assert!(STACK_WINDOW_BASE > KERNBASE);
static_assertions::const_assert_eq!(STACK_WINDOW_BASE % 4096, 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn knobs_clamp_zero() {
        set_preempt_period(0);
        assert_eq!(preempt_period(), 1);
        set_preempt_period(DEFAULT_PREEMPT_PERIOD);

        set_tick_interval(0);
        assert_eq!(tick_interval(), 1);
        set_tick_interval(DEFAULT_TICK_CYCLES);
    }

    #[test]
    fn stack_window_sits_below_phystop() {
        assert_eq!(STACK_WINDOW_BASE, 0x87c0_0000);
    }
}
