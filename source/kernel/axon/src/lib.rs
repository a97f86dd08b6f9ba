// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: AXON single-hart kernel core
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Host unit + property tests per module; QEMU boot via axon-boot
//! PUBLIC API: early_boot_init(), kmain(), usys::*, mm, task, sched, trap, syscall, fs
//! DEPENDS_ON: bitflags, spin, linked_list_allocator, riscv, sbi-rt, static_assertions
//! INVARIANTS: One hart; kernel state owned by `kmain::Kernel`; no unwrap outside tests
//!
//! The crate builds for `riscv64gc-unknown-none-elf` and for the host. Host
//! builds replace CSR access and the context switch with portable stubs so
//! allocator, page-table, scheduler and dispatcher logic run under
//! `cargo test`.

#![cfg_attr(not(test), no_std)]
#![forbid(clippy::unwrap_used)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[macro_use]
mod diag;
#[macro_use]
pub mod uart;

mod arch;
mod boot;
pub mod config;
pub mod fs;
pub mod hal;
mod heap;
pub mod kmain;
pub mod mm;
mod panic;
pub mod sched;
pub mod syscall;
pub mod task;
pub mod trap;
pub mod types;
pub mod usys;

pub use boot::early_boot_init;
pub use diag::log;
pub use kmain::kmain;
