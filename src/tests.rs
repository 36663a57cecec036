//! In-process smoke tests for the scheduler core.
//!
//! The runtime is a process singleton, so every test here serializes on
//! one lock and brackets its own startup/shutdown; the heavier scenario
//! tests live in `tests/` where each file gets its own process.

use crate::range::{Range, Ratio};
use crate::Scheduler;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

static TEST_LOCK: Mutex<()> = Mutex::new(());

struct PoolGuard(#[allow(dead_code)] MutexGuard<'static, ()>);

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if crate::is_running() {
            let _ = crate::shutdown();
        }
    }
}

fn pool(nthreads: usize) -> PoolGuard {
    let guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    crate::startup(nthreads);
    PoolGuard(guard)
}

#[test]
fn test_default_schedule_parallel_for() {
    let _pool = pool(4);
    let hits: Arc<Vec<AtomicUsize>> = Arc::new((0..100).map(|_| AtomicUsize::new(0)).collect());
    let hits2 = Arc::clone(&hits);

    crate::parallel_for("fill", 0, 100, move |i| {
        hits2[i as usize].fetch_add(1, Ordering::SeqCst);
    });

    for cell in hits.iter() {
        assert_eq!(cell.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn test_run_unassigned_is_synchronous() {
    let _pool = pool(2);
    let sched = Scheduler::new("sync");
    let ran = Arc::new(AtomicUsize::new(0));
    let ran2 = Arc::clone(&ran);

    // No assignments were made, so this executes in place.
    sched.run("nothing-assigned", move || {
        ran2.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn test_manual_loop_schedule_two_steps() {
    let _pool = pool(3);
    let sched = Scheduler::new("manual");
    sched.clear_assignments();
    sched.assign_loop_group("compute", &[0, 1, 2]);

    let total = Arc::new(AtomicUsize::new(0));
    for _step in 0..2 {
        let total2 = Arc::clone(&total);
        sched.next_step();
        sched.parallel_for("compute", 0, 60, move |_| {
            total2.fetch_add(1, Ordering::SeqCst);
        });
        sched.wait();
    }
    assert_eq!(total.load(Ordering::SeqCst), 120);
}

#[test]
fn test_registry_lookup() {
    let _pool = pool(2);
    let sched = Scheduler::new("findme");
    assert!(Arc::ptr_eq(
        &sched,
        &Scheduler::lookup("findme").expect("registered")
    ));
    assert!(Scheduler::lookup("no-such-schedule").is_none());
}

#[test]
fn test_introspection() {
    let _pool = pool(4);
    let sched = Scheduler::new("intro");
    sched.clear_assignments();
    sched.assign_run("f", 1);
    sched.assign_loop("f_0", 1, Range::new(Ratio::ZERO, Ratio::new(1, 2)));
    sched.assign_loop("f_0", 0, Range::new(Ratio::new(1, 2), Ratio::ONE));

    assert_eq!(sched.get_num_threads(), 4);
    assert_eq!(sched.get_num_subtasks(1), 2);
    assert_eq!(sched.get_num_subtasks(0), 1);
    assert_eq!(sched.get_num_subtasks(3), 0);
    assert_eq!(sched.get_task_num_threads("f_0"), 2);
    assert_eq!(sched.get_task_num_threads("unassigned"), 0);
    assert_eq!(sched.get_task_thread_id(), None);
    sched.print_assignments();
}

#[test]
fn test_step_counter_advances() {
    let _pool = pool(2);
    let before = crate::load_step_counter();
    let sched = Scheduler::new("counting");
    sched.clear_assignments();
    sched.assign_loop_group("l", &[0, 1]);
    sched.next_step();
    sched.parallel_for("l", 0, 10, |_| {});
    sched.wait();
    assert_eq!(crate::load_step_counter(), before + 1);
}
