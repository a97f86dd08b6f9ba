// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel bring-up, kernel context object and the syscall gate
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Gate behaviour without a kernel (host); bring-up on QEMU
//! PUBLIC API: kmain(), syscall_gate(), yield_now()
//! DEPENDS_ON: hal::VirtMachine, mm, task::ProcessTable, sched::Scheduler, trap, fs::FileStore
//! INVARIANTS: Paging is active before any process exists; the kernel object is published
//!             once and reached only through `kernel_ptr()`; no reference into it outlives a
//!             context switch
//!
//! Bring-up order: frame pool, kernel page table, paging, process table,
//! file store, timer, initial processes, scheduler loop.

use core::mem::MaybeUninit;
use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::fs::FileStore;
use crate::hal::virt::{VirtHart, VirtMachine};
use crate::hal::{Hart, Timer};
use crate::mm::{self, FrameAllocator, KernelLayout, MapError, PageTable, VerifyError};
use crate::sched::{self, Scheduler};
use crate::syscall::Error as SysError;
use crate::task::{Entry, Process, ProcessTable, SpawnError};
use crate::trap::{self, TickState, TrapContext, TrapFrame, TrapOutcome};

/// Aggregated kernel state initialised during boot.
struct Kernel {
    hal: VirtMachine,
    frames: FrameAllocator,
    kernel_table: PageTable,
    tasks: ProcessTable,
    scheduler: Scheduler,
    files: FileStore,
    ticks: TickState,
}

/// Bring-up failure.
#[derive(Debug)]
pub enum BootError {
    KernelMap(MapError),
    Verify(VerifyError),
    Spawn(SpawnError),
}

static mut KERNEL_STATE: MaybeUninit<Kernel> = MaybeUninit::uninit();
static KERNEL_READY: AtomicBool = AtomicBool::new(false);

fn kernel_ptr() -> Option<*mut Kernel> {
    if !KERNEL_READY.load(Ordering::Acquire) {
        return None;
    }
    // SAFETY: only the address is taken; the value was written before READY was set.
    Some(unsafe { addr_of_mut!(KERNEL_STATE) }.cast::<Kernel>())
}

/// Moves `kernel` into its static home and publishes it to trap entry.
///
/// # Safety
///
/// Called once, before interrupts are enabled.
unsafe fn publish(kernel: Kernel) -> *mut Kernel {
    // SAFETY: single hart; nothing reads the slot before READY is set.
    let slot = unsafe { &mut *addr_of_mut!(KERNEL_STATE) };
    let ptr: *mut Kernel = slot.write(kernel);
    KERNEL_READY.store(true, Ordering::Release);
    ptr
}

impl Kernel {
    /// # Safety
    ///
    /// `layout.pool` must be RAM owned by nobody else.
    unsafe fn new(layout: &KernelLayout) -> Result<Self, BootError> {
        let mut frames = FrameAllocator::empty();
        // SAFETY: forwarded caller contract.
        unsafe { frames.init(layout.pool.start, layout.pool.end) };
        log_info!(
            target: "kmain",
            "frames: [{:#x}, {:#x}) {} pages",
            layout.pool.start,
            layout.pool.end,
            frames.free_pages()
        );

        let kernel_table = mm::build_kernel_table(&mut frames, layout).map_err(BootError::KernelMap)?;
        #[cfg(debug_assertions)]
        {
            let leaves = kernel_table.verify(&frames).map_err(BootError::Verify)?;
            log_debug!(target: "kmain", "kvm: verified {} leaves", leaves);
        }
        #[cfg(feature = "debug_uart")]
        kernel_table.dump(&frames);

        let hal = VirtMachine::new();
        mm::activate(&kernel_table, hal.mmu(), hal.tlb());

        Ok(Self {
            hal,
            frames,
            kernel_table,
            tasks: ProcessTable::new(process_start),
            scheduler: Scheduler::new(),
            files: FileStore::new(),
            ticks: TickState::from_config(),
        })
    }

    fn trap(&mut self, frame: &mut TrapFrame) -> TrapOutcome {
        let mut ctx = TrapContext {
            tasks: &mut self.tasks,
            frames: &mut self.frames,
            files: &mut self.files,
            console: self.hal.uart(),
            timer: self.hal.timer(),
            ticks: &mut self.ticks,
        };
        trap::handle_trap(frame, &mut ctx)
    }

    fn spawn(&mut self, entry: Entry) -> Result<(), BootError> {
        let root = Some(self.kernel_table.root());
        let pid = self.tasks.create_process(&mut self.frames, entry, root).map_err(BootError::Spawn)?;
        log_info!(target: "kmain", "spawned pid {}", pid);
        Ok(())
    }

    fn arm_timer(&self) {
        let timer = self.hal.timer();
        timer.set_wakeup(timer.now().wrapping_add(self.ticks.interval()));
        crate::arch::riscv::enable_timer_interrupts();
    }
}

/// Kernel entry after [`crate::early_boot_init`]: brings the kernel up, starts
/// one process per entry in `init`, and runs the scheduler forever.
pub fn kmain(init: &[Entry]) -> ! {
    let layout = kernel_layout();
    // SAFETY: the pool lies between the image and the stack window.
    let kernel = match unsafe { Kernel::new(&layout) } {
        Ok(kernel) => kernel,
        Err(err) => panic!("kernel bring-up failed: {:?}", err),
    };
    // SAFETY: first and only publication, interrupts are still masked.
    let kernel = unsafe { publish(kernel) };

    let mut started = 0;
    for &entry in init {
        // SAFETY: no process runs yet; this is the only reference.
        match unsafe { (*kernel).spawn(entry) } {
            Ok(()) => started += 1,
            Err(err) => log_error!(target: "kmain", "initial process not started: {:?}", err),
        }
    }
    let (used, free) = crate::heap::stats();
    log_info!(target: "kmain", "heap: {} used, {} free", used, free);

    // SAFETY: as above.
    unsafe { (*kernel).arm_timer() };
    kprintln!("axon: {} of {} processes started", started, init.len());

    // SAFETY: the kernel object lives in a static and is never moved again;
    // the HAL field is disjoint from the scheduler and the table.
    unsafe {
        let hart = (*kernel).hal.hart();
        Scheduler::run(addr_of_mut!((*kernel).scheduler), addr_of_mut!((*kernel).tasks), hart)
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
fn kernel_layout() -> KernelLayout {
    KernelLayout::from_linker()
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
fn kernel_layout() -> KernelLayout {
    panic!("kmain is only available on the riscv64 none target");
}

/// # Safety
///
/// Must run on the current process's stack with no reference into the kernel live.
unsafe fn yield_current(kernel: *mut Kernel) -> bool {
    // SAFETY: forwarded caller contract.
    unsafe {
        sched::yield_to_scheduler(
            addr_of_mut!((*kernel).scheduler),
            addr_of_mut!((*kernel).tasks),
            &VirtHart,
        )
    }
}

/// Trap entry from the assembly vector.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub(crate) fn on_trap(frame: &mut TrapFrame) {
    let Some(kernel) = kernel_ptr() else {
        panic!("trap before kernel init: {}", trap::describe_cause(frame.scause));
    };
    // SAFETY: traps run with interrupts masked; nothing else holds the kernel.
    let outcome = unsafe { (*kernel).trap(frame) };
    match outcome {
        TrapOutcome::Resume => {}
        // SAFETY: the trap frame lives on the interrupted process's stack.
        TrapOutcome::Preempt | TrapOutcome::Retry => unsafe {
            yield_current(kernel);
        },
        TrapOutcome::Exit => {
            // SAFETY: as above.
            unsafe { yield_current(kernel) };
            panic!("exited process resumed");
        }
    }
}

/// Software syscall entry for kernel-mode processes.
///
/// Builds an environment-call frame, runs the trap dispatcher on it and
/// returns a0. `exit` never returns; a `wait` with nothing to reap yields and
/// retries until a zombie appears.
pub fn syscall_gate(number: usize, args: [usize; 3]) -> isize {
    let hart = VirtHart;
    let was_enabled = hart.intr_enabled();
    hart.intr_off();
    let ret = loop {
        let Some(kernel) = kernel_ptr() else {
            break SysError::NoProcess.errno();
        };
        let mut frame = TrapFrame::env_call(number, args);
        // SAFETY: interrupts are masked and no reference into the kernel is live.
        match unsafe { (*kernel).trap(&mut frame) } {
            TrapOutcome::Resume | TrapOutcome::Preempt => break frame.ret() as isize,
            // SAFETY: running on the caller's own stack.
            TrapOutcome::Retry => unsafe {
                yield_current(kernel);
            },
            TrapOutcome::Exit => {
                // SAFETY: as above.
                unsafe { yield_current(kernel) };
                panic!("exited process resumed");
            }
        }
    };
    if was_enabled {
        hart.intr_on();
    }
    ret
}

/// Gives the hart back to the scheduler; returns when picked again.
pub fn yield_now() {
    let Some(kernel) = kernel_ptr() else {
        return;
    };
    let hart = VirtHart;
    let was_enabled = hart.intr_enabled();
    // SAFETY: called from process code on its own stack.
    unsafe { yield_current(kernel) };
    if was_enabled {
        hart.intr_on();
    }
}

/// First code of every process: runs its entry, then exits with status 0.
extern "C" fn process_start() -> ! {
    // SAFETY: the scheduler set `current` before switching here.
    let entry = kernel_ptr().and_then(|k| unsafe { (*k).tasks.current().and_then(Process::entry) });
    // Logging takes the console lock, so it happens before interrupts are on.
    if entry.is_none() {
        log_error!(target: "kmain", "process started without an entry");
    }
    VirtHart.intr_on();
    if let Some(entry) = entry {
        entry();
    }
    crate::usys::exit(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::{Syscall, ESRCH};

    #[test]
    fn gate_without_kernel_reports_no_process() {
        assert_eq!(syscall_gate(Syscall::GetPid.number(), [0; 3]), -ESRCH);
        assert_eq!(syscall_gate(99, [1, 2, 3]), -ESRCH);
    }

    #[test]
    fn yield_without_kernel_returns() {
        yield_now();
    }

    #[test]
    #[should_panic(expected = "riscv64")]
    fn kmain_needs_the_os_target() {
        kmain(&[]);
    }
}
