// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Minimal structured logging with severity levels
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Line formatting unit tests; emission exercised on QEMU
//! PUBLIC API: log_* macros, emit(level,target,args)
//! DEPENDS_ON: uart::KernelUart
//! INVARIANTS: Debug/Trace only in debug builds; single-line emission; host builds discard

use core::fmt::{self, Arguments, Write};

/// Logging severity used by the kernel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Level {
    const fn tag(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    const fn enabled(self) -> bool {
        match self {
            Level::Debug | Level::Trace => cfg!(debug_assertions),
            _ => true,
        }
    }
}

/// Formats one `[LEVEL target] message` line into `out`.
fn write_line<W: Write>(
    out: &mut W,
    level: Level,
    target: &str,
    args: Arguments<'_>,
) -> fmt::Result {
    out.write_fmt(format_args!("[{} {}] ", level.tag(), target))?;
    out.write_fmt(args)?;
    out.write_char('\n')
}

/// Emits a structured log line if the level is enabled for the current build.
pub fn emit(level: Level, target: &'static str, args: Arguments<'_>) {
    if !level.enabled() {
        return;
    }

    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let mut uart = crate::uart::KernelUart::lock();
        let _ = write_line(&mut *uart, level, target, args);
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = write_line(&mut Discard, level, target, args);
    }
}

/// Host sink: there is no UART to write to.
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
struct Discard;

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
impl Write for Discard {
    fn write_str(&mut self, _s: &str) -> fmt::Result {
        Ok(())
    }
}

#[macro_export]
macro_rules! log_error {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Error, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Error, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_warn {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Warn, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Warn, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_info {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Info, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Info, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_debug {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Debug, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Debug, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_trace {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Trace, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Trace, module_path!(), format_args!($($arg)+));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_carries_tag_and_target() {
        let mut out = String::new();
        write_line(&mut out, Level::Warn, "mm", format_args!("free_page: {:#x}", 0x1001))
            .expect("format");
        assert_eq!(out, "[WARN mm] free_page: 0x1001\n");
    }

    #[test]
    fn debug_levels_follow_build_profile() {
        assert!(Level::Error.enabled());
        assert!(Level::Info.enabled());
        assert_eq!(Level::Trace.enabled(), cfg!(debug_assertions));
    }
}
