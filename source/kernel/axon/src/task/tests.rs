// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Unit tests for the process table
//! OWNERS: @kernel-sched-team
//! NOTE: Tests only; kernel stacks come from a host arena

use super::*;
use crate::mm::testing::Arena;

extern "C" fn parked() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

fn body() {}

fn table() -> ProcessTable {
    ProcessTable::new(parked)
}

#[test]
fn create_assigns_increasing_pids_and_runnable_slots() {
    let arena = Arena::new(4);
    let mut frames = arena.allocator();
    let mut procs = table();
    let a = procs.create_process(&mut frames, body, None).expect("first");
    let b = procs.create_process(&mut frames, body, None).expect("second");
    assert_eq!(a, Pid::from_raw(1));
    assert_eq!(b, Pid::from_raw(2));
    assert_eq!(procs.count(ProcState::Runnable), 2);
    assert_eq!(procs.slot(0).and_then(Process::pid), Some(a));
    assert_eq!(procs.slot(1).and_then(Process::pid), Some(b));
    assert_eq!(frames.free_pages(), 2);
}

#[test]
fn new_context_starts_launcher_at_stack_top() {
    let arena = Arena::new(1);
    let mut frames = arena.allocator();
    let mut procs = table();
    procs.create_process(&mut frames, body, Some(Ppn::from_raw(0x80200))).expect("create");
    let p = procs.slot(0).expect("slot");
    let kstack = p.kstack().expect("stack");
    assert_eq!(p.context().sp, kstack.raw() + PAGE_SIZE);
    assert_eq!(p.context().ra, parked as usize);
    assert_eq!(p.entry().map(|e| e as usize), Some(body as usize));
    assert_eq!(p.root(), Some(Ppn::from_raw(0x80200)));
    assert_eq!(p.parent(), None);
}

#[test]
fn full_table_consumes_no_slot_or_pid() {
    let arena = Arena::new(NPROC + 2);
    let mut frames = arena.allocator();
    let mut procs = table();
    for _ in 0..NPROC {
        procs.create_process(&mut frames, body, None).expect("within capacity");
    }
    let free = frames.free_pages();
    assert_eq!(procs.create_process(&mut frames, body, None), Err(SpawnError::TableFull));
    assert_eq!(frames.free_pages(), free);
    assert_eq!(procs.count(ProcState::Unused), 0);

    // The next pid handed out is still NPROC + 1.
    procs.set_current(Some(0));
    procs.exit_process(0).expect("exit");
    procs.set_current(None);
    procs.wait_process(&mut frames).expect("reap");
    let pid = procs.create_process(&mut frames, body, None).expect("reuse");
    assert_eq!(pid.as_raw(), NPROC as u32 + 1);
}

#[test]
fn stack_exhaustion_consumes_no_pid() {
    let arena = Arena::new(1);
    let mut frames = arena.allocator();
    let mut procs = table();
    procs.create_process(&mut frames, body, None).expect("first");
    assert_eq!(procs.create_process(&mut frames, body, None), Err(SpawnError::OutOfMemory));
    assert_eq!(procs.count(ProcState::Unused), NPROC - 1);
    procs.set_current(Some(0));
    procs.exit_process(0).expect("exit");
    procs.set_current(None);
    procs.wait_process(&mut frames).expect("reap");
    assert_eq!(procs.create_process(&mut frames, body, None), Ok(Pid::from_raw(2)));
}

#[test]
fn exit_requires_current_process() {
    let mut procs = table();
    assert_eq!(procs.exit_process(3), Err(ExitError::NoCurrent));
}

#[test]
fn exited_process_is_reclaimed_by_wait() {
    let arena = Arena::new(2);
    let mut frames = arena.allocator();
    let mut procs = table();
    let pid = procs.create_process(&mut frames, body, None).expect("create");
    assert_eq!(procs.wait_process(&mut frames), Err(WaitError::NoZombie));

    procs.set_current(Some(0));
    assert_eq!(procs.exit_process(42), Ok(pid));
    assert_eq!(procs.slot(0).map(Process::state), Some(ProcState::Zombie));
    // Exit alone releases nothing.
    assert_eq!(frames.free_pages(), 1);
    procs.set_current(None);

    assert_eq!(procs.wait_process(&mut frames), Ok(Reaped { pid, status: 42 }));
    assert_eq!(procs.slot(0).map(Process::state), Some(ProcState::Unused));
    assert_eq!(frames.free_pages(), 2);
    assert_eq!(procs.wait_process(&mut frames), Err(WaitError::NoZombie));

    let next = procs.create_process(&mut frames, body, None).expect("slot reused");
    assert_eq!(procs.slot(0).and_then(Process::pid), Some(next));
}

#[test]
fn wait_skips_the_current_zombie() {
    let arena = Arena::new(2);
    let mut frames = arena.allocator();
    let mut procs = table();
    procs.create_process(&mut frames, body, None).expect("create");
    procs.set_current(Some(0));
    procs.exit_process(1).expect("exit");
    assert_eq!(procs.wait_process(&mut frames), Err(WaitError::NoZombie));
}

#[test]
fn child_records_current_process_as_parent() {
    let arena = Arena::new(2);
    let mut frames = arena.allocator();
    let mut procs = table();
    let parent = procs.create_process(&mut frames, body, None).expect("parent");
    procs.set_current(Some(0));
    procs.create_process(&mut frames, body, None).expect("child");
    assert_eq!(procs.slot(1).and_then(Process::parent), Some(parent));
    assert_eq!(procs.current_pid(), Some(parent));
}
