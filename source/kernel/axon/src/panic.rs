// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Panic handler emitting diagnostics over the raw UART
//! OWNERS: @kernel-team
//! PUBLIC API: panic handler (no_std)
//! DEPENDS_ON: trap::last_trap(), uart::raw_writer()
//! INVARIANTS: Lock-free output; no allocations; parks the hart

#[cfg(all(not(test), target_os = "none", feature = "panic_handler"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    use core::fmt::Write;

    crate::arch::riscv::intr_off();
    let mut w = crate::uart::raw_writer();
    let _ = w.write_str("\nPANIC: ");
    if let Some(location) = info.location() {
        let _ = write!(w, "{}:{}: ", location.file(), location.line());
    }
    let _ = writeln!(w, "{}", info.message());

    if let Some(frame) = crate::trap::last_trap() {
        let _ = w.write_str("PANIC: last trap:\n");
        let _ = crate::trap::fmt_trap(&frame, &mut w);
    }

    loop {
        crate::arch::riscv::wait_for_interrupt();
    }
}
