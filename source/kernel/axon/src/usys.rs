// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Syscall wrappers for process code.
//!
//! Each wrapper marshals its arguments into the a0..a2 convention and
//! enters the dispatcher through [`crate::kmain::syscall_gate`]. Results
//! are the raw a0 value: non-negative on success, a negative errno on
//! failure.

use core::ffi::CStr;

use crate::fs::OpenFlags;
use crate::kmain::syscall_gate;
use crate::syscall::Syscall;

fn call(sys: Syscall, args: [usize; 3]) -> isize {
    syscall_gate(sys.number(), args)
}

pub fn getpid() -> isize {
    call(Syscall::GetPid, [0; 3])
}

/// Always fails with `-ENOSYS`.
pub fn fork() -> isize {
    call(Syscall::Fork, [0; 3])
}

/// Terminates the calling process with `status`.
pub fn exit(status: i32) -> ! {
    let ret = call(Syscall::Exit, [status as isize as usize, 0, 0]);
    panic!("exit returned {}", ret);
}

/// Blocks until some process has exited; returns its pid and stores its
/// exit status through `status` when given.
pub fn wait(status: Option<&mut i32>) -> isize {
    let ptr = status.map_or(0, |s| s as *mut i32 as usize);
    call(Syscall::Wait, [ptr, 0, 0])
}

pub fn write(fd: usize, buf: &[u8]) -> isize {
    call(Syscall::Write, [fd, buf.as_ptr() as usize, buf.len()])
}

pub fn open(path: &CStr, flags: OpenFlags) -> isize {
    call(Syscall::Open, [path.as_ptr() as usize, flags.bits() as usize, 0])
}

pub fn close(fd: usize) -> isize {
    call(Syscall::Close, [fd, 0, 0])
}

pub fn read(fd: usize, buf: &mut [u8]) -> isize {
    call(Syscall::Read, [fd, buf.as_mut_ptr() as usize, buf.len()])
}

pub fn unlink(path: &CStr) -> isize {
    call(Syscall::Unlink, [path.as_ptr() as usize, 0, 0])
}

/// Voluntarily gives up the hart.
pub fn yield_now() {
    crate::kmain::yield_now();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::ESRCH;

    #[test]
    fn calls_fail_cleanly_before_bring_up() {
        assert_eq!(getpid(), -ESRCH);
        assert_eq!(write(1, b"early"), -ESRCH);
        let mut status = 0;
        assert_eq!(wait(Some(&mut status)), -ESRCH);
        assert_eq!(status, 0);
    }

    #[test]
    #[should_panic(expected = "exit returned")]
    fn exit_never_returns() {
        exit(1);
    }
}
