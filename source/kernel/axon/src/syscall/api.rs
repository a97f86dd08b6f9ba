// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall handler implementations
//! OWNERS: @kernel-team
//! PUBLIC API: Context, sys_* handlers, fetch_str()
//! DEPENDS_ON: task::ProcessTable, mm::FrameAllocator, fs::FileStore, hal::Uart
//! INVARIANTS: Handlers never switch contexts themselves; exit and blocking wait are
//!             reported as Error::TaskExit / Error::WouldBlock for the trap layer
//!
//! Processes run in the kernel address space, so buffer arguments are plain
//! kernel virtual addresses.

use crate::fs::{Fd, FileStore, FsError, OpenFlags, FIRST_FD};
use crate::hal::Uart;
use crate::mm::FrameAllocator;
use crate::task::ProcessTable;

use super::{Args, Error, SysResult};

/// Console output descriptor.
pub const STDOUT: usize = 1;

/// Capacity of the path buffer, terminator included.
const PATH_MAX: usize = 64;

/// Kernel state borrowed by one syscall.
pub struct Context<'a> {
    pub tasks: &'a mut ProcessTable,
    pub frames: &'a mut FrameAllocator,
    pub files: &'a mut FileStore,
    pub console: &'a dyn Uart,
}

impl<'a> Context<'a> {
    pub fn new(
        tasks: &'a mut ProcessTable,
        frames: &'a mut FrameAllocator,
        files: &'a mut FileStore,
        console: &'a dyn Uart,
    ) -> Self {
        Self { tasks, frames, files, console }
    }
}

pub(super) fn sys_getpid(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    let pid = ctx.tasks.current_pid().ok_or(Error::NoProcess)?;
    Ok(pid.as_raw() as usize)
}

pub(super) fn sys_fork(_ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Err(Error::Unsupported)
}

pub(super) fn sys_exit(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let status = args.int(0)? as i32;
    ctx.tasks.exit_process(status)?;
    Err(Error::TaskExit)
}

pub(super) fn sys_wait(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let status_ptr = args.addr(0)?;
    let reaped = ctx.tasks.wait_process(ctx.frames)?;
    if status_ptr != 0 {
        // SAFETY: a non-null status pointer names an i32 in the caller's address space.
        unsafe { (status_ptr as *mut i32).write_unaligned(reaped.status) };
    }
    Ok(reaped.pid.as_raw() as usize)
}

pub(super) fn sys_write(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let fd = args.addr(0)?;
    // SAFETY: the caller hands over `count` readable bytes at `buf`.
    let bytes = unsafe { user_slice(args.addr(1)?, args.addr(2)?)? };
    match fd {
        STDOUT => {
            for &byte in bytes {
                ctx.console.write_byte(byte);
            }
            Ok(bytes.len())
        }
        fd if fd >= FIRST_FD => Ok(ctx.files.write(Fd::from_raw(fd), bytes)?),
        _ => Err(Error::Fs(FsError::BadDescriptor)),
    }
}

pub(super) fn sys_open(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let mut path = [0u8; PATH_MAX];
    let len = fetch_str(args.addr(0)?, &mut path)?;
    let flags = OpenFlags::from_bits_truncate(args.int(1)? as u32);
    let fd = ctx.files.open(&path[..len], flags)?;
    Ok(fd.as_raw())
}

pub(super) fn sys_close(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    ctx.files.close(Fd::from_raw(args.addr(0)?))?;
    Ok(0)
}

pub(super) fn sys_read(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let fd = Fd::from_raw(args.addr(0)?);
    // SAFETY: the caller hands over `count` writable bytes at `buf`.
    let buf = unsafe { user_slice_mut(args.addr(1)?, args.addr(2)?)? };
    Ok(ctx.files.read(fd, buf)?)
}

pub(super) fn sys_unlink(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let mut path = [0u8; PATH_MAX];
    let len = fetch_str(args.addr(0)?, &mut path)?;
    ctx.files.unlink(&path[..len])?;
    Ok(0)
}

/// Copies the NUL-terminated string at `addr` into `buf`.
///
/// Copies at most `buf.len() - 1` bytes and always terminates `buf`; longer
/// strings are truncated. Returns the copied length without the terminator.
pub fn fetch_str(addr: usize, buf: &mut [u8]) -> SysResult<usize> {
    if buf.is_empty() {
        return Err(Error::BadArgument);
    }
    if addr == 0 {
        return Err(Error::BadAddress);
    }
    let src = addr as *const u8;
    let mut len = 0;
    while len + 1 < buf.len() {
        // SAFETY: reading stops at the first NUL or at the bound.
        let byte = unsafe { src.add(len).read() };
        if byte == 0 {
            break;
        }
        buf[len] = byte;
        len += 1;
    }
    buf[len] = 0;
    Ok(len)
}

/// # Safety
///
/// `addr..addr + len` must be readable for the duration of the syscall.
unsafe fn user_slice<'a>(addr: usize, len: usize) -> SysResult<&'a [u8]> {
    // A null buffer is malformed even when empty.
    if addr == 0 {
        return Err(Error::BadAddress);
    }
    if len == 0 {
        return Ok(&[]);
    }
    if addr.checked_add(len).is_none() {
        return Err(Error::BadAddress);
    }
    // SAFETY: forwarded caller contract.
    Ok(unsafe { core::slice::from_raw_parts(addr as *const u8, len) })
}

/// # Safety
///
/// `addr..addr + len` must be writable and unaliased for the duration of the syscall.
unsafe fn user_slice_mut<'a>(addr: usize, len: usize) -> SysResult<&'a mut [u8]> {
    // A null buffer is malformed even when empty.
    if addr == 0 {
        return Err(Error::BadAddress);
    }
    if len == 0 {
        return Ok(&mut []);
    }
    if addr.checked_add(len).is_none() {
        return Err(Error::BadAddress);
    }
    // SAFETY: forwarded caller contract.
    Ok(unsafe { core::slice::from_raw_parts_mut(addr as *mut u8, len) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::testing::Arena;
    use crate::syscall::{dispatch, Syscall, EBADF, EEXIST, ENOSYS};
    use core::cell::RefCell;

    extern "C" fn parked() -> ! {
        loop {
            core::hint::spin_loop();
        }
    }

    fn body() {}

    #[derive(Default)]
    struct CaptureUart(RefCell<Vec<u8>>);

    impl Uart for CaptureUart {
        fn write_byte(&self, byte: u8) {
            self.0.borrow_mut().push(byte);
        }
    }

    struct Fixture {
        _arena: Arena,
        frames: FrameAllocator,
        tasks: ProcessTable,
        files: FileStore,
        console: CaptureUart,
    }

    impl Fixture {
        /// Two processes; the first is current.
        fn new() -> Self {
            let arena = Arena::new(4);
            let mut frames = arena.allocator();
            let mut tasks = ProcessTable::new(parked);
            tasks.create_process(&mut frames, body, None).expect("create");
            tasks.create_process(&mut frames, body, None).expect("create");
            tasks.set_current(Some(0));
            Self { _arena: arena, frames, tasks, files: FileStore::new(), console: CaptureUart::default() }
        }

        fn call(&mut self, call: Syscall, regs: [usize; 3]) -> SysResult<usize> {
            let mut ctx =
                Context::new(&mut self.tasks, &mut self.frames, &mut self.files, &self.console);
            dispatch(call.number(), &mut ctx, &Args::new(regs))
        }
    }

    #[test]
    fn write_to_console_emits_exact_bytes() {
        let mut fx = Fixture::new();
        let msg = b"hello";
        assert_eq!(fx.call(Syscall::Write, [STDOUT, msg.as_ptr() as usize, msg.len()]), Ok(5));
        assert_eq!(fx.console.0.borrow().as_slice(), b"hello");
    }

    #[test]
    fn write_to_unknown_descriptor_fails() {
        let mut fx = Fixture::new();
        let msg = b"x";
        for fd in [0, 2, 9] {
            let err = fx.call(Syscall::Write, [fd, msg.as_ptr() as usize, 1]).expect_err("fd");
            assert_eq!(err.errno(), -EBADF);
        }
        assert!(fx.console.0.borrow().is_empty());
    }

    #[test]
    fn file_round_trip_through_syscalls() {
        let mut fx = Fixture::new();
        let path = b"/greeting\0";
        let fd = fx.call(Syscall::Open, [path.as_ptr() as usize, 1, 0]).expect("create");
        assert_eq!(fd, FIRST_FD);
        let text = b"hi there";
        assert_eq!(fx.call(Syscall::Write, [fd, text.as_ptr() as usize, text.len()]), Ok(8));
        assert_eq!(fx.call(Syscall::Close, [fd, 0, 0]), Ok(0));

        let again = fx.call(Syscall::Open, [path.as_ptr() as usize, 1, 0]).expect_err("exists");
        assert_eq!(again.errno(), -EEXIST);

        let fd = fx.call(Syscall::Open, [path.as_ptr() as usize, 0, 0]).expect("open");
        let mut buf = [0u8; 32];
        assert_eq!(fx.call(Syscall::Read, [fd, buf.as_mut_ptr() as usize, buf.len()]), Ok(8));
        assert_eq!(&buf[..8], text);
        assert_eq!(fx.call(Syscall::Read, [fd, buf.as_mut_ptr() as usize, buf.len()]), Ok(0));

        assert_eq!(fx.call(Syscall::Unlink, [path.as_ptr() as usize, 0, 0]), Ok(0));
        assert!(!fx.files.exists(b"/greeting"));
    }

    #[test]
    fn getpid_reports_current_process() {
        let mut fx = Fixture::new();
        assert_eq!(fx.call(Syscall::GetPid, [0; 3]), Ok(1));
        fx.tasks.set_current(None);
        assert_eq!(fx.call(Syscall::GetPid, [0; 3]), Err(Error::NoProcess));
    }

    #[test]
    fn fork_is_unsupported() {
        let mut fx = Fixture::new();
        let err = fx.call(Syscall::Fork, [0; 3]).expect_err("fork");
        assert_eq!(err.errno(), -ENOSYS);
    }

    #[test]
    fn exit_then_wait_reports_status() {
        let mut fx = Fixture::new();
        fx.tasks.set_current(Some(1));
        assert_eq!(fx.call(Syscall::Exit, [(-3isize) as usize, 0, 0]), Err(Error::TaskExit));

        fx.tasks.set_current(Some(0));
        let mut status = 0i32;
        let pid = fx.call(Syscall::Wait, [&mut status as *mut i32 as usize, 0, 0]);
        assert_eq!(pid, Ok(2));
        assert_eq!(status, -3);
        assert_eq!(fx.call(Syscall::Wait, [0; 3]), Err(Error::WouldBlock));
    }

    #[test]
    fn wait_accepts_null_status_pointer() {
        let mut fx = Fixture::new();
        fx.tasks.set_current(Some(1));
        let _ = fx.call(Syscall::Exit, [0; 3]);
        fx.tasks.set_current(Some(0));
        assert_eq!(fx.call(Syscall::Wait, [0; 3]), Ok(2));
    }

    #[test]
    fn fetch_str_truncates_at_bound() {
        let src = b"/abcdef\0";
        let mut buf = [0xffu8; 4];
        assert_eq!(fetch_str(src.as_ptr() as usize, &mut buf), Ok(3));
        assert_eq!(&buf, b"/ab\0");

        let mut wide = [0xffu8; 16];
        assert_eq!(fetch_str(src.as_ptr() as usize, &mut wide), Ok(7));
        assert_eq!(&wide[..8], src);
    }

    #[test]
    fn fetch_str_rejects_zero_bound_and_null() {
        let src = b"x\0";
        assert_eq!(fetch_str(src.as_ptr() as usize, &mut []), Err(Error::BadArgument));
        assert_eq!(fetch_str(0, &mut [0u8; 8]), Err(Error::BadAddress));
    }

    #[test]
    fn null_buffer_is_rejected_even_when_empty() {
        let mut fx = Fixture::new();
        assert_eq!(fx.call(Syscall::Write, [STDOUT, 0, 4]), Err(Error::BadAddress));
        assert_eq!(fx.call(Syscall::Write, [STDOUT, 0, 0]), Err(Error::BadAddress));
        assert_eq!(fx.call(Syscall::Read, [3, 0, 0]), Err(Error::BadAddress));
        let empty: &[u8] = &[];
        assert_eq!(fx.call(Syscall::Write, [STDOUT, empty.as_ptr() as usize, 0]), Ok(0));
    }
}
