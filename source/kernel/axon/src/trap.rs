// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//! Trap handling: external ASM prologue/epilogue, cause classification,
//! timer ticks and the environment-call path into the syscall dispatcher.

use core::fmt::{self, Write};
use spin::Mutex;

use crate::fs::FileStore;
use crate::hal::{Timer, Uart};
use crate::mm::FrameAllocator;
use crate::syscall::{self, api, Args, Error as SysError, ESRCH};
use crate::task::ProcessTable;

// ——— include low-level vector from assembly (OS target only) ———
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
core::arch::global_asm!(
    include_str!("arch/riscv/trap.S"),
    TF_SIZE    = const core::mem::size_of::<TrapFrame>(),
    OFF_SEPC   = const 32*8,
    OFF_SSTATUS= const 33*8,
    OFF_SCAUSE = const 34*8,
    OFF_STVAL  = const 35*8,
);

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
extern "C" {
    fn __axon_trap_vector();
}

const INTERRUPT_FLAG: usize = usize::MAX - (usize::MAX >> 1);

/// `scause` code of the supervisor timer interrupt.
pub const CAUSE_SUPERVISOR_TIMER: usize = 5;
/// `scause` code of an environment call.
pub const CAUSE_ENV_CALL: usize = 8;

const A0: usize = 10;
const A1: usize = 11;
const A2: usize = 12;
const A7: usize = 17;

/// Saved register state for an S-mode trap.
/// Must match `arch/riscv/trap.S` save/restore layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrapFrame {
    /// x0..x31 (x0 is always 0; we never write it).
    pub x: [usize; 32],
    pub sepc: usize,
    pub sstatus: usize,
    pub scause: usize,
    pub stval: usize,
}

static_assertions::const_assert_eq!(core::mem::size_of::<TrapFrame>(), 36 * 8);

impl TrapFrame {
    pub const fn zeroed() -> Self {
        Self { x: [0; 32], sepc: 0, sstatus: 0, scause: 0, stval: 0 }
    }

    /// Frame of an environment call for `number` with arguments a0..a2.
    pub fn env_call(number: usize, args: [usize; 3]) -> Self {
        let mut frame = Self::zeroed();
        frame.scause = CAUSE_ENV_CALL;
        frame.x[A7] = number;
        frame.x[A0..=A2].copy_from_slice(&args);
        frame
    }

    /// Return value register a0.
    pub fn ret(&self) -> usize {
        self.x[A0]
    }
}

/// What the trap handler decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapCause {
    SupervisorTimer,
    EnvCall,
    Other(usize),
}

impl TrapCause {
    pub fn classify(scause: usize) -> Self {
        let code = scause & !INTERRUPT_FLAG;
        match (is_interrupt(scause), code) {
            (true, CAUSE_SUPERVISOR_TIMER) => TrapCause::SupervisorTimer,
            (false, CAUSE_ENV_CALL) => TrapCause::EnvCall,
            _ => TrapCause::Other(scause),
        }
    }
}

/// How the interrupted context continues after the handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapOutcome {
    /// Return to the interrupted code.
    Resume,
    /// Switch to the scheduler, then resume here.
    Preempt,
    /// The current process exited; switch to the scheduler for good.
    Exit,
    /// Switch to the scheduler, then re-issue the same call (`sepc` untouched).
    Retry,
}

/// Timer tick bookkeeping.
#[derive(Clone, Copy, Debug)]
pub struct TickState {
    ticks: u64,
    interval: u64,
    preempt_every: u64,
}

impl TickState {
    pub const fn new(interval: u64, preempt_every: u64) -> Self {
        let interval = if interval == 0 { 1 } else { interval };
        let preempt_every = if preempt_every == 0 { 1 } else { preempt_every };
        Self { ticks: 0, interval, preempt_every }
    }

    /// Snapshot of the runtime knobs in [`crate::config`].
    pub fn from_config() -> Self {
        Self::new(crate::config::tick_interval(), crate::config::preempt_period())
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Counts one tick; true when this tick is a preemption point.
    fn tick(&mut self) -> bool {
        self.ticks = self.ticks.wrapping_add(1);
        self.ticks % self.preempt_every == 0
    }
}

/// Kernel state borrowed by one trap.
pub struct TrapContext<'a> {
    pub tasks: &'a mut ProcessTable,
    pub frames: &'a mut FrameAllocator,
    pub files: &'a mut FileStore,
    pub console: &'a dyn Uart,
    pub timer: &'a dyn Timer,
    pub ticks: &'a mut TickState,
}

// ——— diagnostics ———

static LAST_TRAP: Mutex<Option<TrapFrame>> = Mutex::new(None);

pub fn record(frame: &TrapFrame) {
    *LAST_TRAP.lock() = Some(*frame);
}

/// Most recent trap frame; `None` if none was taken or the record is locked.
pub fn last_trap() -> Option<TrapFrame> {
    LAST_TRAP.try_lock().and_then(|guard| *guard)
}

#[inline]
pub fn is_interrupt(scause: usize) -> bool {
    scause & INTERRUPT_FLAG != 0
}

pub fn describe_cause(scause: usize) -> &'static str {
    let code = scause & !INTERRUPT_FLAG;
    if is_interrupt(scause) {
        match code {
            1 => "SupervisorSoftInt",
            5 => "SupervisorTimerInt",
            9 => "SupervisorExternalInt",
            _ => "Interrupt",
        }
    } else {
        match code {
            0 => "InstructionAddressMisaligned",
            1 => "InstructionAccessFault",
            2 => "IllegalInstruction",
            3 => "Breakpoint",
            4 => "LoadAddressMisaligned",
            5 => "LoadAccessFault",
            6 => "StoreAMOAddressMisaligned",
            7 => "StoreAMOAccessFault",
            8 => "EnvironmentCall",
            9 => "EnvironmentCallFromSMode",
            12 => "InstructionPageFault",
            13 => "LoadPageFault",
            15 => "StoreAMOPageFault",
            _ => "Exception",
        }
    }
}

pub fn fmt_trap<W: Write>(frame: &TrapFrame, f: &mut W) -> fmt::Result {
    writeln!(f, " sepc=0x{:016x}", frame.sepc)?;
    writeln!(f, " scause=0x{:016x} ({})", frame.scause, describe_cause(frame.scause))?;
    writeln!(f, " stval=0x{:016x}", frame.stval)?;
    writeln!(f, " a0..a7 = {:016x?}", &frame.x[A0..=A7])
}

// ——— dispatch ———

/// Handles one trap described by `frame`.
///
/// Panics on any cause other than the supervisor timer and environment calls.
pub fn handle_trap(frame: &mut TrapFrame, ctx: &mut TrapContext<'_>) -> TrapOutcome {
    record(frame);
    match TrapCause::classify(frame.scause) {
        TrapCause::SupervisorTimer => handle_timer(ctx),
        TrapCause::EnvCall => handle_ecall(frame, ctx),
        TrapCause::Other(_) => fatal(frame),
    }
}

fn handle_timer(ctx: &mut TrapContext<'_>) -> TrapOutcome {
    let preempt = ctx.ticks.tick();
    ctx.timer.set_wakeup(ctx.timer.now().wrapping_add(ctx.ticks.interval()));
    if preempt && ctx.tasks.current_slot().is_some() {
        TrapOutcome::Preempt
    } else {
        TrapOutcome::Resume
    }
}

/// Runs the syscall named by a7 on behalf of the current process.
///
/// The live frame is saved into the process before dispatch and reloaded
/// from it afterwards with a0 and `sepc` updated.
pub fn handle_ecall(frame: &mut TrapFrame, ctx: &mut TrapContext<'_>) -> TrapOutcome {
    let Some(process) = ctx.tasks.current_mut() else {
        log_warn!(target: "trap", "ecall with no current process");
        frame.x[A0] = (-ESRCH) as usize;
        frame.sepc = frame.sepc.wrapping_add(4);
        return TrapOutcome::Resume;
    };
    *process.frame_mut() = *frame;

    let number = frame.x[A7];
    let args = Args::new([frame.x[A0], frame.x[A1], frame.x[A2]]);
    let mut sys = api::Context::new(ctx.tasks, ctx.frames, ctx.files, ctx.console);
    let ret = match syscall::dispatch(number, &mut sys, &args) {
        Err(SysError::TaskExit) => return TrapOutcome::Exit,
        Err(SysError::WouldBlock) => return TrapOutcome::Retry,
        result => syscall::encode(result),
    };

    if let Some(process) = ctx.tasks.current_mut() {
        let saved = process.frame_mut();
        saved.x[A0] = ret;
        saved.sepc = saved.sepc.wrapping_add(4);
        *frame = *saved;
    }
    TrapOutcome::Resume
}

fn fatal(frame: &TrapFrame) -> ! {
    let mut u = crate::uart::raw_writer();
    let _ = u.write_str("TRAP: unhandled\n");
    let _ = fmt_trap(frame, &mut u);
    panic!(
        "unhandled trap {} (scause=0x{:x} sepc=0x{:x} stval=0x{:x})",
        describe_cause(frame.scause),
        frame.scause,
        frame.sepc,
        frame.stval
    );
}

/// Install trap vector; call once during early boot (before enabling SIE).
pub fn install_trap_vector() {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    crate::arch::riscv::install_trap_vector(__axon_trap_vector as usize);
}

// ——— Rust trap handler called from assembly ———

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[no_mangle]
extern "C" fn __trap_rust(frame: &mut TrapFrame) {
    crate::kmain::on_trap(frame);
}
