//! Startup/shutdown lifecycle.

mod common;

use lockstep::Scheduler;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn test_startup_shutdown_cycle() {
    {
        let _pool = common::pool(3);
        assert!(lockstep::is_running());
        assert_eq!(lockstep::num_threads(), 3);

        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        lockstep::parallel_for("warm", 0, 30, move |_| {
            ran2.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(ran.load(Ordering::Relaxed), 30);
    }
    assert!(!lockstep::is_running());

    // The pool can come back up in the same process.
    {
        let _pool = common::pool(2);
        assert_eq!(lockstep::num_threads(), 2);
        let sched = Scheduler::new("again");
        sched.clear_assignments();
        sched.assign_loop_group("l", &[0, 1]);
        sched.next_step();
        sched.parallel_for("l", 0, 10, |_| {});
        sched.wait();
    }
    assert!(!lockstep::is_running());
}

#[test]
fn test_step_counter_is_monotone_across_instances() {
    let _pool = common::pool(2);
    let sched = Scheduler::new("mono");
    sched.clear_assignments();
    sched.assign_loop_group("l", &[0, 1]);

    let mut last = lockstep::load_step_counter();
    for _ in 0..5 {
        sched.next_step();
        sched.parallel_for("l", 0, 4, |_| {});
        sched.wait();
        let now = lockstep::load_step_counter();
        assert_eq!(now, last + 1);
        last = now;
    }
}

#[test]
fn test_shutdown_with_idle_workers() {
    let _pool = common::pool(8);
    // No steps at all: workers park on the counter and must still join.
}

#[test]
fn test_registry_cleared_on_shutdown() {
    {
        let _pool = common::pool(2);
        let _sched = Scheduler::new("ephemeral");
        assert!(Scheduler::lookup("ephemeral").is_some());
    }
    let _pool = common::pool(2);
    assert!(Scheduler::lookup("ephemeral").is_none());
}
