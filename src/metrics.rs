//! Optional scheduler counters, compiled in with the `metrics` feature.

#[cfg(feature = "metrics")]
pub use imp::*;

#[cfg(feature = "metrics")]
mod imp {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Instant;

    /// Counters over the life of the process.
    #[derive(Debug)]
    pub struct Metrics {
        /// Steps published via `next_step` (implicit default-schedule steps
        /// included).
        pub steps: AtomicU64,
        /// Subtasks driven to completion.
        pub subtasks_completed: AtomicU64,
        /// Coroutine suspensions taken.
        pub fiber_pauses: AtomicU64,
        /// Successful work steals inside auto-balanced loops.
        pub steals: AtomicU64,
        /// High-priority tasks pulled forward by `yield_now`.
        pub yields_taken: AtomicU64,
        pub start_time: Instant,
    }

    lazy_static::lazy_static! {
        pub static ref METRICS: Metrics = Metrics {
            steps: AtomicU64::new(0),
            subtasks_completed: AtomicU64::new(0),
            fiber_pauses: AtomicU64::new(0),
            steals: AtomicU64::new(0),
            yields_taken: AtomicU64::new(0),
            start_time: Instant::now(),
        };
    }

    /// Point-in-time copy of the counters.
    #[derive(Debug, Clone)]
    pub struct MetricsSnapshot {
        pub steps: u64,
        pub subtasks_completed: u64,
        pub fiber_pauses: u64,
        pub steals: u64,
        pub yields_taken: u64,
        pub elapsed_seconds: f64,
    }

    impl MetricsSnapshot {
        pub fn steps_per_second(&self) -> f64 {
            if self.elapsed_seconds > 0.0 {
                self.steps as f64 / self.elapsed_seconds
            } else {
                0.0
            }
        }
    }

    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            steps: METRICS.steps.load(Ordering::Relaxed),
            subtasks_completed: METRICS.subtasks_completed.load(Ordering::Relaxed),
            fiber_pauses: METRICS.fiber_pauses.load(Ordering::Relaxed),
            steals: METRICS.steals.load(Ordering::Relaxed),
            yields_taken: METRICS.yields_taken.load(Ordering::Relaxed),
            elapsed_seconds: METRICS.start_time.elapsed().as_secs_f64(),
        }
    }
}

macro_rules! hook {
    ($name:ident, $counter:ident) => {
        #[inline]
        pub(crate) fn $name() {
            #[cfg(feature = "metrics")]
            imp::METRICS
                .$counter
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    };
}

hook!(on_step, steps);
hook!(on_subtask, subtasks_completed);
hook!(on_fiber_pause, fiber_pauses);
hook!(on_steal, steals);
hook!(on_yield, yields_taken);
