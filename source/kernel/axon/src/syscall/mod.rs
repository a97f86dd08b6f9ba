// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall decoding, dispatch and error encoding
//! OWNERS: @kernel-team
//! PUBLIC API: Syscall, Args, Error, SysResult, dispatch()
//! DEPENDS_ON: task, fs, syscall::api
//! INVARIANTS: Stable numbers 1..=9; number in a7, arguments in a0..a2, result in a0;
//!             failures reach the caller as a negative errno

pub mod api;

use core::fmt;

use crate::fs::FsError;
use crate::task::{ExitError, SpawnError, WaitError};

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Error>;

/// Public syscall numbers.
#[repr(usize)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Syscall {
    GetPid = 1,
    Fork = 2,
    Exit = 3,
    Wait = 4,
    Write = 5,
    Open = 6,
    Close = 7,
    Read = 8,
    Unlink = 9,
}

impl Syscall {
    /// Maps a raw a7 value to a syscall.
    pub const fn decode(number: usize) -> Option<Self> {
        Some(match number {
            1 => Self::GetPid,
            2 => Self::Fork,
            3 => Self::Exit,
            4 => Self::Wait,
            5 => Self::Write,
            6 => Self::Open,
            7 => Self::Close,
            8 => Self::Read,
            9 => Self::Unlink,
            _ => return None,
        })
    }

    pub const fn number(self) -> usize {
        self as usize
    }
}

/// Syscall arguments passed in registers a0-a2.
#[derive(Default, Clone, Copy, Debug)]
pub struct Args {
    regs: [usize; 3],
}

impl Args {
    pub const fn new(regs: [usize; 3]) -> Self {
        Self { regs }
    }

    /// Argument `index` as a signed integer.
    pub fn int(&self, index: usize) -> SysResult<isize> {
        self.regs.get(index).map(|&r| r as isize).ok_or(Error::BadArgument)
    }

    /// Argument `index` as an address.
    pub fn addr(&self, index: usize) -> SysResult<usize> {
        self.regs.get(index).copied().ok_or(Error::BadArgument)
    }
}

/// Error returned by the dispatcher and handler stack.
#[must_use = "syscall errors must be encoded for the caller"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Number outside the syscall table.
    InvalidSyscall,
    /// Recognised but not implemented (fork).
    Unsupported,
    /// Malformed argument value or argument index.
    BadArgument,
    /// Null or unusable buffer address.
    BadAddress,
    /// No process is bound to the hart.
    NoProcess,
    Spawn(SpawnError),
    Fs(FsError),
    /// Current process exited and must not resume.
    TaskExit,
    /// Nothing to report yet; the call is retried after a yield without advancing `sepc`.
    WouldBlock,
}

impl From<SpawnError> for Error {
    fn from(value: SpawnError) -> Self {
        Self::Spawn(value)
    }
}

impl From<ExitError> for Error {
    fn from(_: ExitError) -> Self {
        Self::NoProcess
    }
}

impl From<WaitError> for Error {
    fn from(value: WaitError) -> Self {
        match value {
            WaitError::NoZombie => Self::WouldBlock,
        }
    }
}

impl From<FsError> for Error {
    fn from(value: FsError) -> Self {
        Self::Fs(value)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub const ENOENT: isize = 2;
pub const ESRCH: isize = 3;
pub const EBADF: isize = 9;
pub const EAGAIN: isize = 11;
pub const ENOMEM: isize = 12;
pub const EFAULT: isize = 14;
pub const EEXIST: isize = 17;
pub const EINVAL: isize = 22;
pub const ENFILE: isize = 23;
pub const EMFILE: isize = 24;
pub const EFBIG: isize = 27;
pub const ENAMETOOLONG: isize = 36;
pub const ENOSYS: isize = 38;

impl Error {
    /// Negative errno reported to the caller in a0.
    pub const fn errno(self) -> isize {
        -match self {
            Error::InvalidSyscall | Error::Unsupported => ENOSYS,
            Error::BadArgument => EINVAL,
            Error::BadAddress => EFAULT,
            Error::NoProcess => ESRCH,
            Error::Spawn(SpawnError::TableFull) => EAGAIN,
            Error::Spawn(SpawnError::OutOfMemory) => ENOMEM,
            Error::Fs(fs) => fs_errno(fs),
            Error::TaskExit | Error::WouldBlock => EAGAIN,
        }
    }
}

const fn fs_errno(err: FsError) -> isize {
    match err {
        FsError::InvalidPath => EINVAL,
        FsError::NameTooLong => ENAMETOOLONG,
        FsError::NotFound => ENOENT,
        FsError::AlreadyExists => EEXIST,
        FsError::NoInodes => ENFILE,
        FsError::TooManyOpen => EMFILE,
        FsError::BadDescriptor => EBADF,
        FsError::FileTooLarge => EFBIG,
        FsError::OutOfMemory => ENOMEM,
    }
}

/// Register encoding of a handler result.
pub fn encode(result: SysResult<usize>) -> usize {
    match result {
        Ok(value) => value,
        Err(err) => err.errno() as usize,
    }
}

/// Decodes `number` and runs its handler.
pub fn dispatch(number: usize, ctx: &mut api::Context<'_>, args: &Args) -> SysResult<usize> {
    let Some(call) = Syscall::decode(number) else {
        log_warn!(target: "sys", "unknown syscall {}", number);
        return Err(Error::InvalidSyscall);
    };
    #[cfg(feature = "debug_uart")]
    log_debug!(target: "sys", "{:?} {:x?}", call, args);
    match call {
        Syscall::GetPid => api::sys_getpid(ctx, args),
        Syscall::Fork => api::sys_fork(ctx, args),
        Syscall::Exit => api::sys_exit(ctx, args),
        Syscall::Wait => api::sys_wait(ctx, args),
        Syscall::Write => api::sys_write(ctx, args),
        Syscall::Open => api::sys_open(ctx, args),
        Syscall::Close => api::sys_close(ctx, args),
        Syscall::Read => api::sys_read(ctx, args),
        Syscall::Unlink => api::sys_unlink(ctx, args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_round_trip_through_decode() {
        for number in 1..=9 {
            let call = Syscall::decode(number).expect("known number");
            assert_eq!(call.number(), number);
        }
        assert_eq!(Syscall::decode(0), None);
        assert_eq!(Syscall::decode(10), None);
        assert_eq!(Syscall::decode(usize::MAX), None);
    }

    #[test]
    fn args_reject_out_of_range_index() {
        let args = Args::new([usize::MAX, 0x8000_1000, 7]);
        assert_eq!(args.int(0), Ok(-1));
        assert_eq!(args.addr(1), Ok(0x8000_1000));
        assert_eq!(args.int(2), Ok(7));
        assert_eq!(args.int(3), Err(Error::BadArgument));
        assert_eq!(args.addr(6), Err(Error::BadArgument));
    }

    #[test]
    fn errors_encode_as_negative_errno() {
        assert_eq!(Error::InvalidSyscall.errno(), -ENOSYS);
        assert_eq!(Error::Unsupported.errno(), -ENOSYS);
        assert_eq!(Error::from(FsError::BadDescriptor).errno(), -EBADF);
        assert_eq!(Error::from(SpawnError::TableFull).errno(), -EAGAIN);
        assert_eq!(encode(Err(Error::NoProcess)) as isize, -ESRCH);
        assert_eq!(encode(Ok(42)), 42);
    }

    #[test]
    fn lifecycle_errors_convert() {
        assert_eq!(Error::from(WaitError::NoZombie), Error::WouldBlock);
        assert_eq!(Error::from(ExitError::NoCurrent), Error::NoProcess);
    }
}
