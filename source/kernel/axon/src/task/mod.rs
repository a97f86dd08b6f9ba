// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process table
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (creation, capacity, exit/wait reclamation)
//! PUBLIC API: ProcessTable, Process, ProcState, Context, Entry, SpawnError, ExitError, WaitError
//! DEPENDS_ON: mm::FrameAllocator, trap::TrapFrame
//! INVARIANTS: Pids strictly increase and are never reused; at most one slot is current;
//!             a slot is Unused before creation and after reclamation; each live process owns
//!             exactly one kernel-stack page until `wait_process` frees it

use crate::config::NPROC;
use crate::mm::{AllocError, FrameAllocator, PAGE_SIZE};
use crate::trap::TrapFrame;
use crate::types::{PhysAddr, Pid, Ppn};

/// Body of a kernel-mode process.
pub type Entry = fn();

/// First code a new process runs: looks up its entry and calls it.
pub type Launcher = extern "C" fn() -> !;

/// Lifecycle state of a process slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcState {
    Unused,
    Embryo,
    Runnable,
    Running,
    Sleeping,
    Zombie,
}

/// Callee-saved register state preserved across a context switch.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,
    pub s: [usize; 12],
}

impl Context {
    pub const fn zeroed() -> Self {
        Self { ra: 0, sp: 0, s: [0; 12] }
    }

    /// A context whose first resumption jumps to `pc` with `sp = stack_top`.
    pub const fn launch(pc: usize, stack_top: usize) -> Self {
        Self { ra: pc, sp: stack_top, s: [0; 12] }
    }
}

/// Process creation failure.
#[must_use = "spawn errors must be handled"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// Every slot is in use.
    TableFull,
    /// No page for the kernel stack.
    OutOfMemory,
}

impl From<AllocError> for SpawnError {
    fn from(_: AllocError) -> Self {
        SpawnError::OutOfMemory
    }
}

#[must_use = "exit errors must be handled"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitError {
    /// No process is bound to the hart.
    NoCurrent,
}

#[must_use = "wait errors must be handled"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// No zombie is ready; poll again later.
    NoZombie,
}

/// A reclaimed zombie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reaped {
    pub pid: Pid,
    pub status: i32,
}

/// One slot of the process table.
pub struct Process {
    pid: Option<Pid>,
    state: ProcState,
    context: Context,
    root: Option<Ppn>,
    kstack: Option<PhysAddr>,
    entry: Option<Entry>,
    exit_status: i32,
    parent: Option<Pid>,
    frame: TrapFrame,
}

impl Process {
    const fn vacant() -> Self {
        Self {
            pid: None,
            state: ProcState::Unused,
            context: Context::zeroed(),
            root: None,
            kstack: None,
            entry: None,
            exit_status: 0,
            parent: None,
            frame: TrapFrame::zeroed(),
        }
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn state(&self) -> ProcState {
        self.state
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Page-table root the process runs under.
    pub fn root(&self) -> Option<Ppn> {
        self.root
    }

    pub fn kstack(&self) -> Option<PhysAddr> {
        self.kstack
    }

    pub fn entry(&self) -> Option<Entry> {
        self.entry
    }

    pub fn exit_status(&self) -> i32 {
        self.exit_status
    }

    pub fn parent(&self) -> Option<Pid> {
        self.parent
    }

    /// Register snapshot of the most recent trap taken by this process.
    pub fn frame(&self) -> &TrapFrame {
        &self.frame
    }

    pub fn frame_mut(&mut self) -> &mut TrapFrame {
        &mut self.frame
    }
}

/// Fixed-capacity process table.
pub struct ProcessTable {
    slots: [Process; NPROC],
    next_pid: Pid,
    current: Option<usize>,
    launcher: Launcher,
}

impl ProcessTable {
    /// Empty table. New processes first run `launcher` on their own stack.
    pub fn new(launcher: Launcher) -> Self {
        Self {
            slots: core::array::from_fn(|_| Process::vacant()),
            next_pid: Pid::FIRST,
            current: None,
            launcher,
        }
    }

    /// Claims the first Unused slot for a process that will run `entry`.
    ///
    /// The kernel stack is allocated before the pid is assigned, so a failed
    /// creation consumes neither a slot nor a pid.
    pub fn create_process(
        &mut self,
        frames: &mut FrameAllocator,
        entry: Entry,
        root: Option<Ppn>,
    ) -> Result<Pid, SpawnError> {
        let Some(index) = self.slots.iter().position(|p| p.state == ProcState::Unused) else {
            log_warn!(target: "task", "create_process: table full");
            return Err(SpawnError::TableFull);
        };
        let kstack = frames.alloc_page().map_err(|err| {
            log_warn!(target: "task", "create_process: no kernel stack");
            SpawnError::from(err)
        })?;
        let pid = self.next_pid;
        self.next_pid = pid.next();
        let parent = self.current_pid();
        let launch_pc = self.launcher as usize;

        let slot = &mut self.slots[index];
        slot.state = ProcState::Embryo;
        slot.pid = Some(pid);
        slot.kstack = Some(kstack);
        slot.root = root;
        slot.entry = Some(entry);
        slot.exit_status = 0;
        slot.parent = parent;
        slot.frame = TrapFrame::zeroed();
        slot.context = Context::launch(launch_pc, kstack.raw() + PAGE_SIZE);
        slot.state = ProcState::Runnable;
        log_debug!(target: "task", "pid {} created in slot {} (kstack {:#x})", pid, index, kstack);
        Ok(pid)
    }

    /// Marks the current process a Zombie with `status`. Nothing is reclaimed.
    pub fn exit_process(&mut self, status: i32) -> Result<Pid, ExitError> {
        let process = self.current_mut().ok_or(ExitError::NoCurrent)?;
        process.exit_status = status;
        process.state = ProcState::Zombie;
        let pid = process.pid.ok_or(ExitError::NoCurrent)?;
        log_debug!(target: "task", "pid {} exited with {}", pid, status);
        Ok(pid)
    }

    /// One poll for a Zombie: frees its kernel stack and returns the slot to Unused.
    ///
    /// The current process is never reaped; its stack is still in use until
    /// it has switched away.
    pub fn wait_process(&mut self, frames: &mut FrameAllocator) -> Result<Reaped, WaitError> {
        let current = self.current;
        let index = self
            .slots
            .iter()
            .enumerate()
            .position(|(i, p)| p.state == ProcState::Zombie && Some(i) != current)
            .ok_or(WaitError::NoZombie)?;

        let slot = &mut self.slots[index];
        let reaped = Reaped { pid: slot.pid.unwrap_or(Pid::from_raw(0)), status: slot.exit_status };
        if let Some(kstack) = slot.kstack.take() {
            // SAFETY: the zombie no longer runs, so nothing uses its stack.
            if let Err(err) = unsafe { frames.free_page(kstack) } {
                log_error!(target: "task", "pid {}: kernel stack not returned: {:?}", reaped.pid, err);
            }
        }
        *slot = Process::vacant();
        log_debug!(target: "task", "pid {} reaped (status {})", reaped.pid, reaped.status);
        Ok(reaped)
    }

    pub fn current_slot(&self) -> Option<usize> {
        self.current
    }

    pub fn current(&self) -> Option<&Process> {
        self.current.map(|i| &self.slots[i])
    }

    pub fn current_mut(&mut self) -> Option<&mut Process> {
        self.current.map(move |i| &mut self.slots[i])
    }

    pub fn current_pid(&self) -> Option<Pid> {
        self.current().and_then(Process::pid)
    }

    /// Binds slot `index` (or nothing) to the hart.
    pub(crate) fn set_current(&mut self, index: Option<usize>) {
        self.current = index.filter(|&i| i < NPROC);
    }

    pub fn slot(&self, index: usize) -> Option<&Process> {
        self.slots.get(index)
    }

    /// Raw pointer to the saved context of slot `index`, for the switch primitive.
    pub(crate) fn context_ptr(&mut self, index: usize) -> Option<*mut Context> {
        self.slots.get_mut(index).map(|p| &mut p.context as *mut Context)
    }

    pub(crate) fn set_state(&mut self, index: usize, state: ProcState) {
        if let Some(p) = self.slots.get_mut(index) {
            p.state = state;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.slots.iter()
    }

    /// Number of slots currently in `state`.
    pub fn count(&self, state: ProcState) -> usize {
        self.slots.iter().filter(|p| p.state == state).count()
    }
}

#[cfg(test)]
mod tests;
