// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Cooperative round-robin scheduler
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests with a recording hart
//! PUBLIC API: Scheduler::{new, sweep, run}, yield_to_scheduler()
//! DEPENDS_ON: task::ProcessTable, hal::Hart
//! INVARIANTS: Slots are visited strictly in table order; a process only leaves Running via the
//!             scheduler's return path; interrupts are off while `current`
//!             is bound and across every switch
//!
//! The scheduler and the table are passed as raw pointers. A process that is
//! switched into reaches the same objects through the kernel context, so no
//! reference into them may be live across a switch.

use core::marker::PhantomData;
use core::ptr::{addr_of, addr_of_mut};

use crate::config::NPROC;
use crate::hal::Hart;
use crate::task::{Context, ProcState, ProcessTable};

/// Holds the scheduler's own saved context.
pub struct Scheduler {
    context: Context,
    sweeps: u64,
    dispatches: u64,
    _not_send: PhantomData<*mut ()>,
}

static_assertions::assert_not_impl_any!(Scheduler: Send, Sync);

impl Scheduler {
    pub const fn new() -> Self {
        Self { context: Context::zeroed(), sweeps: 0, dispatches: 0, _not_send: PhantomData }
    }

    /// Completed passes over the table.
    pub fn sweeps(&self) -> u64 {
        self.sweeps
    }

    /// Total number of switches into a process.
    pub fn dispatches(&self) -> u64 {
        self.dispatches
    }

    /// One pass over the table in slot order; returns how many processes ran.
    ///
    /// # Safety
    ///
    /// `this` and `tasks` must be valid for the whole call and every
    /// Runnable slot must hold a context that is safe to resume.
    pub unsafe fn sweep<H: Hart + ?Sized>(
        this: *mut Scheduler,
        tasks: *mut ProcessTable,
        hart: &H,
    ) -> usize {
        let mut ran = 0;
        for index in 0..NPROC {
            // Off before `current` is bound: a tick in between would preempt
            // from the scheduler's own stack.
            hart.intr_off();
            let load = {
                // SAFETY: caller contract; interrupts are off, so no trap can
                // alias the table, and the borrow ends before the switch.
                let table = unsafe { &mut *tasks };
                if table.slot(index).map(|p| p.state()) != Some(ProcState::Runnable) {
                    continue;
                }
                table.set_state(index, ProcState::Running);
                table.set_current(Some(index));
                match table.context_ptr(index) {
                    Some(ctx) => ctx,
                    None => continue,
                }
            };
            // SAFETY: `this` is valid per the caller contract.
            let save = unsafe { addr_of_mut!((*this).context) };

            // SAFETY: `load` belongs to a Runnable process, `save` to the scheduler.
            unsafe { hart.switch(save, load) };

            // SAFETY: the process has switched back; nothing else holds the table.
            let table = unsafe { &mut *tasks };
            table.set_current(None);
            if table.slot(index).map(|p| p.state()) == Some(ProcState::Running) {
                table.set_state(index, ProcState::Runnable);
            }
            ran += 1;
        }
        // SAFETY: caller contract.
        let sched = unsafe { &mut *this };
        sched.sweeps += 1;
        sched.dispatches += ran as u64;
        ran
    }

    /// Scheduler loop. Interrupts are enabled between sweeps; the hart idles
    /// when no process was runnable.
    ///
    /// # Safety
    ///
    /// As for [`Scheduler::sweep`]; both objects must live forever.
    pub unsafe fn run<H: Hart + ?Sized>(
        this: *mut Scheduler,
        tasks: *mut ProcessTable,
        hart: &H,
    ) -> ! {
        log_info!(target: "sched", "scheduler: entering loop");
        loop {
            hart.intr_on();
            // SAFETY: forwarded caller contract.
            if unsafe { Self::sweep(this, tasks, hart) } == 0 {
                hart.wait_for_interrupt();
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Suspends the current process and resumes the scheduler loop.
///
/// Returns `false` without switching when no process is current. When the
/// scheduler later picks the process again, this call returns `true` with
/// interrupts still disabled.
///
/// # Safety
///
/// Must be called on the current process's own kernel stack, with the
/// scheduler suspended inside [`Scheduler::sweep`].
pub unsafe fn yield_to_scheduler<H: Hart + ?Sized>(
    this: *mut Scheduler,
    tasks: *mut ProcessTable,
    hart: &H,
) -> bool {
    let save = {
        // SAFETY: caller contract; the borrow ends before the switch.
        let table = unsafe { &mut *tasks };
        match table.current_slot().and_then(|i| table.context_ptr(i)) {
            Some(ctx) => ctx,
            None => return false,
        }
    };
    // SAFETY: caller contract.
    let load = unsafe { addr_of!((*this).context) };
    hart.intr_off();
    // SAFETY: the scheduler context was saved by the sweep that switched to us.
    unsafe { hart.switch(save, load) };
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::testing::Arena;
    use crate::types::Pid;
    use core::cell::{Cell, RefCell};

    extern "C" fn parked() -> ! {
        loop {
            core::hint::spin_loop();
        }
    }

    fn body() {}

    /// Runs each "process" for zero instructions: the switch returns at once,
    /// as if the process yielded immediately.
    struct RecordingHart {
        tasks: *mut ProcessTable,
        ran: RefCell<Vec<Pid>>,
        switched_with_irqs_on: Cell<bool>,
        irqs: Cell<bool>,
        exit_on_first_run: Option<Pid>,
        switches: RefCell<Vec<(usize, usize)>>,
        bound_with_irqs_on: Cell<bool>,
    }

    impl RecordingHart {
        /// Notes whether a process is bound as current while interrupts are on.
        fn observe(&self) {
            let table = unsafe { &*self.tasks };
            if self.irqs.get() && table.current_slot().is_some() {
                self.bound_with_irqs_on.set(true);
            }
        }
    }

    impl RecordingHart {
        fn new(tasks: *mut ProcessTable) -> Self {
            Self {
                tasks,
                ran: RefCell::new(Vec::new()),
                switched_with_irqs_on: Cell::new(false),
                irqs: Cell::new(true),
                exit_on_first_run: None,
                switches: RefCell::new(Vec::new()),
                bound_with_irqs_on: Cell::new(false),
            }
        }
    }

    impl Hart for RecordingHart {
        unsafe fn switch(&self, save: *mut Context, load: *const Context) {
            self.switches.borrow_mut().push((save as usize, load as usize));
            self.observe();
            if self.irqs.get() {
                self.switched_with_irqs_on.set(true);
            }
            let table = unsafe { &mut *self.tasks };
            if let Some(pid) = table.current_pid() {
                let first = !self.ran.borrow().contains(&pid);
                self.ran.borrow_mut().push(pid);
                if first && self.exit_on_first_run == Some(pid) {
                    table.exit_process(7).expect("exit");
                }
            }
        }

        fn intr_on(&self) {
            self.irqs.set(true);
            self.observe();
        }

        fn intr_off(&self) {
            self.observe();
            self.irqs.set(false);
        }

        fn intr_enabled(&self) -> bool {
            self.irqs.get()
        }

        fn wait_for_interrupt(&self) {}
    }

    #[test]
    fn sweep_visits_runnable_slots_in_order() {
        let arena = Arena::new(3);
        let mut frames = arena.allocator();
        let mut tasks = ProcessTable::new(parked);
        let pids: Vec<Pid> = (0..3)
            .map(|_| tasks.create_process(&mut frames, body, None).expect("create"))
            .collect();
        let mut sched = Scheduler::new();
        let tasks_ptr = &mut tasks as *mut ProcessTable;
        let hart = RecordingHart::new(tasks_ptr);

        for _ in 0..2 {
            assert_eq!(unsafe { Scheduler::sweep(&mut sched, tasks_ptr, &hart) }, 3);
        }
        let expected: Vec<Pid> = pids.iter().chain(pids.iter()).copied().collect();
        assert_eq!(*hart.ran.borrow(), expected);
        assert_eq!(sched.sweeps(), 2);
        assert_eq!(sched.dispatches(), 6);
        assert_eq!(tasks.count(ProcState::Runnable), 3);
        assert_eq!(tasks.current_slot(), None);
        assert!(!hart.switched_with_irqs_on.get());
    }

    #[test]
    fn sweep_saves_into_scheduler_and_loads_process_context() {
        let arena = Arena::new(1);
        let mut frames = arena.allocator();
        let mut tasks = ProcessTable::new(parked);
        tasks.create_process(&mut frames, body, None).expect("create");
        let mut sched = Scheduler::new();
        let tasks_ptr = &mut tasks as *mut ProcessTable;
        let hart = RecordingHart::new(tasks_ptr);
        unsafe { Scheduler::sweep(&mut sched, tasks_ptr, &hart) };

        let sched_ctx = &sched.context as *const Context as usize;
        let proc_ctx = tasks.slot(0).map(|p| p.context() as *const Context as usize);
        assert_eq!(hart.switches.borrow().as_slice(), &[(sched_ctx, proc_ctx.expect("slot"))]);
    }

    #[test]
    fn exited_process_stays_zombie_and_is_not_rescheduled() {
        let arena = Arena::new(2);
        let mut frames = arena.allocator();
        let mut tasks = ProcessTable::new(parked);
        let first = tasks.create_process(&mut frames, body, None).expect("create");
        let second = tasks.create_process(&mut frames, body, None).expect("create");
        let mut sched = Scheduler::new();
        let tasks_ptr = &mut tasks as *mut ProcessTable;
        let mut hart = RecordingHart::new(tasks_ptr);
        hart.exit_on_first_run = Some(first);

        unsafe { Scheduler::sweep(&mut sched, tasks_ptr, &hart) };
        assert_eq!(unsafe { Scheduler::sweep(&mut sched, tasks_ptr, &hart) }, 1);
        assert_eq!(*hart.ran.borrow(), vec![first, second, second]);
        assert_eq!(tasks.slot(0).map(|p| p.state()), Some(ProcState::Zombie));
        assert_eq!(tasks.slot(0).map(|p| p.exit_status()), Some(7));
    }

    #[test]
    fn current_is_only_bound_with_interrupts_off() {
        let arena = Arena::new(2);
        let mut frames = arena.allocator();
        let mut tasks = ProcessTable::new(parked);
        tasks.create_process(&mut frames, body, None).expect("create");
        tasks.create_process(&mut frames, body, None).expect("create");
        let mut sched = Scheduler::new();
        let tasks_ptr = &mut tasks as *mut ProcessTable;
        let hart = RecordingHart::new(tasks_ptr);

        for _ in 0..2 {
            hart.intr_on();
            assert_eq!(unsafe { Scheduler::sweep(&mut sched, tasks_ptr, &hart) }, 2);
        }
        assert!(!hart.bound_with_irqs_on.get());
        assert_eq!(hart.switches.borrow().len(), 4);
    }

    #[test]
    fn empty_table_runs_nothing() {
        let mut tasks = ProcessTable::new(parked);
        let mut sched = Scheduler::new();
        let tasks_ptr = &mut tasks as *mut ProcessTable;
        let hart = RecordingHart::new(tasks_ptr);
        assert_eq!(unsafe { Scheduler::sweep(&mut sched, tasks_ptr, &hart) }, 0);
        assert!(hart.switches.borrow().is_empty());
        assert_eq!(sched.sweeps(), 1);
    }

    #[test]
    fn yield_switches_from_current_process_to_scheduler() {
        let arena = Arena::new(1);
        let mut frames = arena.allocator();
        let mut tasks = ProcessTable::new(parked);
        let mut sched = Scheduler::new();
        let tasks_ptr = &mut tasks as *mut ProcessTable;
        let hart = RecordingHart::new(tasks_ptr);

        assert!(!unsafe { yield_to_scheduler(&mut sched, tasks_ptr, &hart) });
        assert!(hart.switches.borrow().is_empty());

        tasks.create_process(&mut frames, body, None).expect("create");
        tasks.set_current(Some(0));
        assert!(unsafe { yield_to_scheduler(&mut sched, tasks_ptr, &hart) });
        let proc_ctx = tasks.slot(0).map(|p| p.context() as *const Context as usize);
        let sched_ctx = &sched.context as *const Context as usize;
        assert_eq!(hart.switches.borrow().as_slice(), &[(proc_ctx.expect("slot"), sched_ctx)]);
        assert!(!hart.irqs.get());
    }
}
