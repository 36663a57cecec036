//! Several named scheduler instances alternating steps over one pool.

mod common;

use lockstep::Scheduler;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[test]
fn test_compute_then_reduce_instances() {
    const NTHREADS: usize = 4;
    const SIZE: usize = 200;
    let _pool = common::pool(NTHREADS);

    let compute = Scheduler::new("compute");
    compute.clear_assignments();
    compute.assign_run_group("f", 0, &[0, 1]);
    compute.assign_run_group("g", 2, &[2, 3]);

    let reduce = Scheduler::new("reduce");
    reduce.clear_assignments();
    reduce.assign_run_group("h", 0, &[0, 1, 2, 3]);

    let a: Arc<Vec<AtomicU32>> = Arc::new((0..SIZE).map(|_| AtomicU32::new(0)).collect());
    let b: Arc<Vec<AtomicU32>> = Arc::new((0..SIZE).map(|_| AtomicU32::new(0)).collect());

    let before = lockstep::load_step_counter();
    for _step in 0..3 {
        compute.next_step();
        {
            let inner = Scheduler::lookup("compute").unwrap();
            let a = Arc::clone(&a);
            compute.run("f", move || {
                let a = Arc::clone(&a);
                inner.parallel_for("f_0", 0, SIZE as i64, move |i| {
                    a[i as usize].store(1, Ordering::Release);
                });
            });
        }
        {
            let inner = Scheduler::lookup("compute").unwrap();
            let b = Arc::clone(&b);
            compute.run("g", move || {
                let b = Arc::clone(&b);
                inner.parallel_for("g_0", 0, SIZE as i64, move |i| {
                    b[i as usize].store(1, Ordering::Release);
                });
            });
        }
        compute.wait();

        reduce.next_step();
        {
            let inner = Scheduler::lookup("reduce").unwrap();
            let a = Arc::clone(&a);
            let b = Arc::clone(&b);
            reduce.run("h", move || {
                let a = Arc::clone(&a);
                let b = Arc::clone(&b);
                inner.parallel_for("h_0", 0, SIZE as i64, move |i| {
                    let i = i as usize;
                    a[i].fetch_add(b[i].load(Ordering::Acquire), Ordering::AcqRel);
                });
            });
        }
        reduce.wait();

        for i in 0..SIZE {
            assert_eq!(a[i].load(Ordering::Acquire), 2, "step result at {}", i);
        }
    }
    // Two instances, three steps each.
    assert_eq!(lockstep::load_step_counter(), before + 6);
}

#[test]
#[should_panic(expected = "while '")]
fn test_two_active_instances_panic() {
    let _pool = common::pool(2);
    // Main-thread-only schedules so the worker idles through the step and
    // shutdown can still join it after the panic unwinds.
    let one = Scheduler::new("one");
    one.clear_assignments();
    one.assign_loop("l1", 0, lockstep::Range::new(lockstep::Ratio::ZERO, lockstep::Ratio::ONE));
    let two = Scheduler::new("two");
    two.clear_assignments();
    two.assign_loop("l2", 0, lockstep::Range::new(lockstep::Ratio::ZERO, lockstep::Ratio::ONE));

    one.next_step();
    // 'one' is active and has not been waited on.
    two.next_step();
}
