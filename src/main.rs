use lockstep::{Ratio, Scheduler};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

fn main() {
    println!("lockstep - Static Task Scheduler\n");

    let num_threads = num_cpus::get().clamp(2, 8);
    lockstep::startup(num_threads);
    println!("Initialized pool with {} threads\n", num_threads);

    // Example 1: ad-hoc loop on the default schedule
    println!("Example 1: default-schedule loop");
    let touched = Arc::new(AtomicUsize::new(0));
    let touched_clone = touched.clone();
    lockstep::parallel_for("warmup", 0, 10_000, move |_i| {
        touched_clone.fetch_add(1, Ordering::Relaxed);
    });
    println!("  touched {} elements\n", touched.load(Ordering::Relaxed));

    // Example 2: a manual schedule reused across steps
    println!("Example 2: manual schedule, {} steps", 5);
    let sched = Scheduler::new("demo");
    sched.clear_assignments();
    let all: Vec<usize> = (0..num_threads).collect();
    sched.assign_run_group("compute", 0, &all);

    let sum = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    for _step in 0..5 {
        sched.next_step();
        let inner = Scheduler::lookup("demo").unwrap();
        let sum_clone = sum.clone();
        sched.run("compute", move || {
            let sum_inner = sum_clone.clone();
            inner.parallel_for("compute_loop", 0, 100_000, move |i| {
                sum_inner.fetch_add(i as usize & 1, Ordering::Relaxed);
            });
        });
        sched.wait();
    }
    println!(
        "  5 steps in {:?}, accumulated {}\n",
        start.elapsed(),
        sum.load(Ordering::Relaxed)
    );

    // Example 3: a reduction
    println!("Example 3: reduction");
    let red_sched = Scheduler::new("reduce-demo");
    red_sched.clear_assignments();
    red_sched.assign_loop_group("tally", &all);
    let reduction = red_sched.create_task_reduction("tally", 0i64);
    red_sched.next_step();
    red_sched.parallel_for_reduce("tally", 0, 1000, |_i| lockstep::collect(1i64), &reduction);
    red_sched.wait();
    println!("  collected: {}\n", reduction.get_result());

    // Example 4: uneven split expressed as exact rationals
    println!("Example 4: uneven loop split");
    let split = Scheduler::new("split-demo");
    split.clear_assignments();
    split.assign_loop("half", 0, lockstep::Range::new(Ratio::ZERO, Ratio::new(1, 2)));
    for (i, tid) in (1..num_threads).enumerate() {
        let n = (num_threads - 1) as i64;
        split.assign_loop(
            "half",
            tid,
            lockstep::Range::new(
                Ratio::new(1, 2) + Ratio::new(i as i64, 2 * n),
                Ratio::new(1, 2) + Ratio::new(i as i64 + 1, 2 * n),
            ),
        );
    }
    let counter = Arc::new(AtomicUsize::new(0));
    let counter_clone = counter.clone();
    split.next_step();
    split.parallel_for("half", 0, 600, move |_| {
        counter_clone.fetch_add(1, Ordering::Relaxed);
    });
    split.wait();
    println!("  600 iterations -> {} executed\n", counter.load(Ordering::Relaxed));

    lockstep::shutdown().expect("clean shutdown");
    println!("Done.");
}
