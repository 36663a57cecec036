//! Overlapping a high-priority communication task with compute loops.
//!
//! Two compute tasks run on disjoint thread groups. Halfway through its
//! iterations, task g raises a flag; every compute thread then calls
//! `yield_now`, but only the thread that owns the high-priority comm task
//! actually runs it. The others resume computing immediately.

use lockstep::Scheduler;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const NTHREADS: usize = 6;
const NITERS: i64 = 1_000_000;

fn main() {
    lockstep::startup(NTHREADS);

    let sched = Scheduler::new("overlap");
    sched.clear_assignments();
    let f_threads: Vec<usize> = (0..NTHREADS / 2).collect();
    let g_threads: Vec<usize> = (NTHREADS / 2..NTHREADS).collect();
    sched.assign_run_group("f", 0, &f_threads);
    sched.assign_run_group("g", NTHREADS / 2, &g_threads);
    sched.assign_run("comm", NTHREADS / 2 - 1);
    sched.set_high_priority("comm");

    let comm_waiting = Arc::new(AtomicBool::new(false));

    sched.next_step();
    {
        let inner = Arc::clone(&sched);
        let waiting = Arc::clone(&comm_waiting);
        sched.run("f", move || {
            let waiting = Arc::clone(&waiting);
            inner.parallel_for("f_0", 0, NITERS, move |i| {
                std::hint::black_box((i as f32).sqrt());
                if waiting.load(Ordering::Relaxed) {
                    println!(
                        "thread {}: communication arrived at iteration {}",
                        lockstep::thread_id(),
                        i
                    );
                    lockstep::yield_now();
                    println!("thread {}: resuming computation", lockstep::thread_id());
                }
            });
        });
    }
    {
        let inner = Arc::clone(&sched);
        let waiting = Arc::clone(&comm_waiting);
        sched.run("g", move || {
            let waiting = Arc::clone(&waiting);
            inner.parallel_for("g_0", 0, NITERS, move |i| {
                if i == NITERS / NTHREADS as i64 / 2 {
                    waiting.store(true, Ordering::Relaxed);
                }
                std::hint::black_box((i as f32).sqrt());
            });
        });
    }
    {
        let waiting = Arc::clone(&comm_waiting);
        sched.run("comm", move || {
            waiting.store(false, Ordering::Relaxed);
            println!("receiving transmission on thread {}...", lockstep::thread_id());
            std::thread::sleep(Duration::from_millis(200));
            println!("transmission received");
        });
    }
    sched.wait();

    sched.print_subtask_times("f_multiloop");
    lockstep::shutdown().expect("clean shutdown");
}
