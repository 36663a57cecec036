//! Shared test harness: the scheduler runtime is a process singleton, so
//! tests in one binary serialize on a lock and bracket their own
//! startup/shutdown.

use std::sync::{Mutex, MutexGuard};

static TEST_LOCK: Mutex<()> = Mutex::new(());

pub struct PoolGuard(#[allow(dead_code)] MutexGuard<'static, ()>);

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if lockstep::is_running() {
            let _ = lockstep::shutdown();
        }
    }
}

/// Brings the pool up with `nthreads` threads for the duration of the
/// returned guard.
pub fn pool(nthreads: usize) -> PoolGuard {
    let guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    lockstep::startup(nthreads);
    PoolGuard(guard)
}
