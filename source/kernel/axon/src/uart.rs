// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Console output over the 16550 UART of the `virt` machine.
//!
//! `KernelUart` is the locked writer used by logging and `kprint!`.
//! `RawUart` bypasses the lock for trap and panic paths where the mutex may
//! already be held. Host builds compile the MMIO accesses out.

use core::fmt::{self, Write};
use spin::Mutex;

use crate::config::UART0_BASE;

const UART_TX: usize = 0x0;
const UART_LSR: usize = 0x5;
const LSR_TX_IDLE: u8 = 1 << 5;

static UART0: Mutex<KernelUart> = Mutex::new(KernelUart::new(UART0_BASE));

/// UART implementation capable of formatted writes.
#[derive(Clone, Copy)]
pub struct KernelUart {
    base: usize,
}

impl KernelUart {
    /// Creates a UART abstraction rooted at `base`.
    pub const fn new(base: usize) -> Self {
        Self { base }
    }

    /// Returns a guard for the console singleton.
    pub fn lock() -> spin::MutexGuard<'static, KernelUart> {
        UART0.lock()
    }

    /// Blocking single-byte emit. A `\n` is followed by `\r`.
    pub fn putc(&self, byte: u8) {
        mmio_putc(self.base, byte);
        if byte == b'\n' {
            mmio_putc(self.base, b'\r');
        }
    }
}

impl Write for KernelUart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &byte in s.as_bytes() {
            self.putc(byte);
        }
        Ok(())
    }
}

#[inline]
fn mmio_putc(base: usize, value: u8) {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: `base` is the identity-mapped UART page; THR/LSR are byte registers.
    unsafe {
        while core::ptr::read_volatile((base + UART_LSR) as *const u8) & LSR_TX_IDLE == 0 {}
        core::ptr::write_volatile((base + UART_TX) as *mut u8, value);
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = (base, value, UART_TX, UART_LSR, LSR_TX_IDLE);
    }
}

/// Lock-free writer for trap and panic contexts.
pub struct RawUart;

impl Write for RawUart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &byte in s.as_bytes() {
            mmio_putc(UART0_BASE, byte);
            if byte == b'\n' {
                mmio_putc(UART0_BASE, b'\r');
            }
        }
        Ok(())
    }
}

pub fn raw_writer() -> RawUart {
    RawUart
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
    let mut uart = KernelUart::lock();
    let _ = uart.write_fmt(args);
}

/// Formatted console print.
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::uart::_print(format_args!($($arg)*))
    };
}

/// Formatted console print terminated by a newline.
#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::kprint!("\n")
    };
    ($($arg:tt)*) => {
        $crate::uart::_print(format_args!("{}\n", format_args!($($arg)*)))
    };
}

/// ANSI terminal control for the serial console.
///
/// The helpers write into any [`Write`] sink: the locked console, the raw
/// writer, or a line buffer that process code hands to the write syscall.
pub mod ansi {
    use core::fmt::{self, Write};

    /// Foreground colours, by their SGR code.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    #[repr(u8)]
    pub enum Color {
        Black = 30,
        Red = 31,
        Green = 32,
        Yellow = 33,
        Blue = 34,
        Magenta = 35,
        Cyan = 36,
        White = 37,
    }

    impl Color {
        pub const fn code(self) -> u8 {
            self as u8
        }
    }

    /// Clears the screen and homes the cursor.
    pub fn clear_screen<W: Write + ?Sized>(out: &mut W) -> fmt::Result {
        out.write_str("\x1b[2J\x1b[H")
    }

    /// Moves the cursor to column `x`, row `y` (both 1-based).
    pub fn goto_xy<W: Write + ?Sized>(out: &mut W, x: u16, y: u16) -> fmt::Result {
        write!(out, "\x1b[{};{}H", y, x)
    }

    pub fn set_color<W: Write + ?Sized>(out: &mut W, fg: Color) -> fmt::Result {
        write!(out, "\x1b[{}m", fg.code())
    }

    pub fn reset_color<W: Write + ?Sized>(out: &mut W) -> fmt::Result {
        out.write_str("\x1b[0m")
    }

    /// Writes `s`, or `(null)` when there is no string.
    pub fn puts<W: Write + ?Sized>(out: &mut W, s: Option<&str>) -> fmt::Result {
        out.write_str(s.unwrap_or("(null)"))
    }
}

#[cfg(test)]
mod tests {
    use super::ansi::{self, Color};

    #[test]
    fn escape_sequences() {
        let mut out = String::new();
        ansi::clear_screen(&mut out).expect("clear");
        ansi::goto_xy(&mut out, 10, 5).expect("goto");
        ansi::set_color(&mut out, Color::Red).expect("color");
        out.push_str("hi");
        ansi::reset_color(&mut out).expect("reset");
        assert_eq!(out, "\x1b[2J\x1b[H\x1b[5;10H\x1b[31mhi\x1b[0m");
    }

    #[test]
    fn missing_string_prints_null_marker() {
        let mut out = String::new();
        ansi::puts(&mut out, None).expect("puts");
        ansi::puts(&mut out, Some("|ok")).expect("puts");
        assert_eq!(out, "(null)|ok");
    }

    #[test]
    fn colour_codes_are_sgr_foregrounds() {
        assert_eq!(Color::Black.code(), 30);
        assert_eq!(Color::White.code(), 37);
    }
}
