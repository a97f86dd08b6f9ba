// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Boot wrapper for the AXON kernel. Provides a minimal `_start` entry
//! point that sets up the stack and global pointer before handing
//! execution to the kernel library, plus the initial processes it runs.
#![no_std]
#![no_main]

use core::ffi::CStr;
use core::fmt::{self, Write};

use axon::fs::OpenFlags;
use axon::uart::ansi::{self, Color};
use axon::usys;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
core::arch::global_asm!(
    r#"
    .section .text._start, "ax", @progbits
    .globl _start
    .align 4
_start:
    la   sp, __stack_top
    /* RISC-V ABI: initialize gp for small-data accesses (Rust may rely on it).
     * Use PC-relative addressing (kernel is linked above 2GiB). */
    .option push
    .option norelax
    la   gp, __global_pointer$
    .option pop
    j    start_rust
"#
);

const STDOUT: usize = 1;
const WORKER_ROUNDS: usize = 3;

/// One console line assembled on the stack; output beyond the buffer is dropped.
struct Line {
    buf: [u8; 96],
    len: usize,
}

impl Line {
    const fn new() -> Self {
        Self { buf: [0; 96], len: 0 }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl Write for Line {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.buf.len() - self.len;
        let n = s.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

/// Formats a line and prints it through the write syscall.
macro_rules! say {
    ($($arg:tt)*) => {{
        let mut line = Line::new();
        let _ = writeln!(line, $($arg)*);
        let _ = usys::write(STDOUT, line.as_bytes());
    }};
}

fn init() {
    let me = usys::getpid();
    say!("init: pid {}", me);
    say!("init: fork -> {}", usys::fork());

    if let Ok(path) = CStr::from_bytes_with_nul(b"/motd\0") {
        let fd = usys::open(path, OpenFlags::CREATE);
        if fd >= 0 {
            usys::write(fd as usize, b"axon says hello");
            usys::close(fd as usize);
        }
        let fd = usys::open(path, OpenFlags::empty());
        let mut buf = [0u8; 32];
        let n = if fd >= 0 { usys::read(fd as usize, &mut buf) } else { fd };
        if n >= 0 {
            say!("init: /motd = {:?}", core::str::from_utf8(&buf[..n as usize]).unwrap_or("<bytes>"));
        } else {
            say!("init: /motd read failed ({})", n);
        }
        usys::close(fd as usize);
        say!("init: unlink -> {}", usys::unlink(path));
    }

    for _ in 0..2 {
        let mut status = 0;
        let pid = usys::wait(Some(&mut status));
        say!("init: reaped pid {} status {}", pid, status);
    }
    let mut line = Line::new();
    let _ = ansi::set_color(&mut line, Color::Green);
    let _ = line.write_str("init: done");
    let _ = ansi::reset_color(&mut line);
    let _ = line.write_char('\n');
    let _ = usys::write(STDOUT, line.as_bytes());
}

fn worker() {
    let me = usys::getpid();
    for round in 0..WORKER_ROUNDS {
        say!("worker {}: round {}", me, round);
        usys::yield_now();
    }
    if me % 2 == 0 {
        usys::exit(me as i32);
    }
}

#[no_mangle]
pub extern "C" fn start_rust() -> ! {
    axon::early_boot_init();
    axon::kmain(&[init, worker, worker])
}
