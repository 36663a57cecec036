//! Step publication overhead using criterion.
//!
//! Measures the cost of driving an empty step through a manual schedule:
//! counter broadcast, barrier traffic and queue draining, with no user
//! work at all.

use criterion::{criterion_group, criterion_main, Criterion};
use lockstep::Scheduler;
use std::sync::Arc;

fn bench_empty_step(c: &mut Criterion) {
    let _ = env_logger::try_init();
    lockstep::startup(4);
    let sched = Scheduler::new("bench-empty");
    sched.clear_assignments();
    sched.assign_loop_group("l", &[0, 1, 2, 3]);

    // Warmup
    for _ in 0..100 {
        sched.next_step();
        sched.parallel_for("l", 0, 0, |_| {});
        sched.wait();
    }

    c.bench_function("empty_step", |b| {
        b.iter(|| {
            sched.next_step();
            sched.parallel_for("l", 0, 0, |_| {});
            sched.wait();
        })
    });
}

fn bench_skip_step(c: &mut Criterion) {
    let sched = Scheduler::lookup("bench-empty").expect("bench schedule");

    c.bench_function("skip_step", |b| {
        b.iter(|| {
            sched.next_step();
            sched.skip_loop("l");
            sched.wait();
        })
    });
}

fn bench_run_task_step(c: &mut Criterion) {
    let sched = Scheduler::new("bench-run");
    sched.clear_assignments();
    sched.assign_run("f", 1);

    let inner = Arc::clone(&sched);
    c.bench_function("run_task_step", move |b| {
        b.iter(|| {
            inner.next_step();
            inner.run("f", || {
                std::hint::black_box(42);
            });
            inner.wait();
        })
    });
}

criterion_group!(
    benches,
    bench_empty_step,
    bench_skip_step,
    bench_run_task_step
);
criterion_main!(benches);
