//! Process-wide scheduler state.
//!
//! The thread pool, the global step counter, the step-completion barrier
//! and the registry of named scheduler instances are owned by a single
//! [`Runtime`] created by [`startup`] and torn down by [`shutdown`].
//! Nothing here is constructed implicitly: calling any other API outside a
//! startup/shutdown bracket is a programmer error.
//!
//! The thread calling `startup` becomes STS thread 0 (the main thread);
//! it never parks on the step counter and drains its own queue inside
//! `Scheduler::wait`.

use crate::barrier::OMBarrier;
use crate::fiber_pool::FiberPool;
use crate::reduction::ReduceValue;
use crate::scheduler::{Scheduler, DEFAULT_NAME};
use crate::spin::wait_until_not;
use crate::{trace, worker};
use core_affinity::CoreId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

pub struct Runtime {
    nthreads: usize,
    step_counter: AtomicI64,
    step_complete: OMBarrier,
    fiber_pool: FiberPool,
    instances: RwLock<HashMap<String, Arc<Scheduler>>>,
    current: RwLock<Arc<Scheduler>>,
    default_instance: Arc<Scheduler>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

static RUNTIME: RwLock<Option<Arc<Runtime>>> = RwLock::new(None);

/// Creates the thread pool (`nthreads` total, including the caller) and
/// the default schedule. Panics if the runtime is already up.
pub fn startup(nthreads: usize) {
    startup_with(nthreads, false);
}

/// Like [`startup`], additionally pinning each pool thread to a core
/// (linear mapping over the detected core list).
pub fn startup_pinned(nthreads: usize) {
    startup_with(nthreads, true);
}

fn startup_with(nthreads: usize, pin: bool) {
    assert!(nthreads >= 1, "the pool needs at least the main thread");
    let mut guard = RUNTIME.write().unwrap();
    assert!(guard.is_none(), "scheduler runtime already started");

    let cores: Vec<Option<CoreId>> = if pin {
        let ids = core_affinity::get_core_ids().unwrap_or_default();
        (0..nthreads)
            .map(|i| ids.get(i % ids.len().max(1)).copied())
            .collect()
    } else {
        vec![None; nthreads]
    };

    let default_instance = Scheduler::new_default(nthreads);
    let mut instances = HashMap::new();
    instances.insert(DEFAULT_NAME.to_string(), Arc::clone(&default_instance));

    let rt = Arc::new(Runtime {
        nthreads,
        step_counter: AtomicI64::new(0),
        step_complete: OMBarrier::new(),
        fiber_pool: FiberPool::new(nthreads),
        instances: RwLock::new(instances),
        current: RwLock::new(Arc::clone(&default_instance)),
        default_instance,
        workers: Mutex::new(Vec::new()),
    });

    worker::set_thread_id(0);
    if let Some(core) = cores[0] {
        core_affinity::set_for_current(core);
    }

    let mut handles = Vec::with_capacity(nthreads.saturating_sub(1));
    for id in 1..nthreads {
        let rt_clone = Arc::clone(&rt);
        let core = cores[id];
        handles.push(
            std::thread::Builder::new()
                .name(format!("lockstep-worker-{}", id))
                .spawn(move || worker::worker_main(id, rt_clone, core))
                .expect("failed to spawn worker thread"),
        );
    }
    *rt.workers.lock().unwrap() = handles;
    *guard = Some(rt);
    log::debug!("runtime up: {} threads, pinned: {}", nthreads, pin);
}

/// Signals shutdown through the step counter, joins every worker and
/// drops the runtime. Reports the number of workers that panicked.
pub fn shutdown() -> Result<(), String> {
    let rt = RUNTIME
        .write()
        .unwrap()
        .take()
        .expect("shutdown without a running runtime");
    rt.step_counter.store(-1, Ordering::Release);
    let handles: Vec<_> = std::mem::take(&mut *rt.workers.lock().unwrap());
    let mut failed = 0usize;
    for handle in handles {
        if handle.join().is_err() {
            failed += 1;
        }
    }
    trace::collect_local_trace();
    rt.instances.write().unwrap().clear();
    log::debug!("runtime down ({} worker failures)", failed);
    if failed > 0 {
        Err(format!("{} worker thread(s) panicked", failed))
    } else {
        Ok(())
    }
}

/// Handle to the running runtime. Panics outside a startup/shutdown
/// bracket.
pub fn runtime() -> Arc<Runtime> {
    RUNTIME
        .read()
        .unwrap()
        .clone()
        .expect("scheduler runtime not started; call startup() first")
}

pub fn is_running() -> bool {
    RUNTIME.read().unwrap().is_some()
}

impl Runtime {
    pub fn num_threads(&self) -> usize {
        self.nthreads
    }

    pub fn load_step_counter(&self) -> i64 {
        self.step_counter.load(Ordering::Acquire)
    }

    /// Spins until the step counter moves off `last`; returns the new
    /// value (negative means shutdown).
    pub(crate) fn wait_on_step_counter(&self, last: i64) -> i64 {
        wait_until_not(&self.step_counter, last)
    }

    /// Arms the step-completion barrier and releases the pool into the
    /// next step. Called by `Scheduler::next_step` with the instance
    /// already published as current.
    pub(crate) fn begin_step(&self) {
        self.step_complete.close(self.nthreads as i32 - 1);
        self.step_counter.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn mark_step_complete(&self) {
        self.step_complete.mark_arrival();
    }

    pub(crate) fn wait_step_complete(&self) {
        self.step_complete.wait();
    }

    /// The instance the pool executes for the current step (the default
    /// instance between steps).
    pub fn current(&self) -> Arc<Scheduler> {
        self.current.read().unwrap().clone()
    }

    pub(crate) fn set_current(&self, sched: &Arc<Scheduler>) {
        *self.current.write().unwrap() = Arc::clone(sched);
    }

    pub fn default_instance(&self) -> Arc<Scheduler> {
        Arc::clone(&self.default_instance)
    }

    pub(crate) fn fiber_pool(&self) -> &FiberPool {
        &self.fiber_pool
    }

    pub(crate) fn register_instance(&self, name: &str, sched: &Arc<Scheduler>) {
        self.instances
            .write()
            .unwrap()
            .insert(name.to_string(), Arc::clone(sched));
    }

    pub(crate) fn lookup_instance(&self, name: &str) -> Option<Arc<Scheduler>> {
        self.instances.read().unwrap().get(name).cloned()
    }
}

// ----- free-function conveniences on the current instance -------------

/// Number of threads in the pool.
pub fn num_threads() -> usize {
    runtime().num_threads()
}

/// Current value of the global step counter.
pub fn load_step_counter() -> i64 {
    runtime().load_step_counter()
}

/// The currently executing scheduler instance (the default schedule when
/// no manual step is active).
pub fn current() -> Arc<Scheduler> {
    runtime().current()
}

/// `run` on the current instance; see [`Scheduler::run`].
pub fn run<F>(label: &str, f: F)
where
    F: Fn() + Send + Sync + 'static,
{
    current().run(label, f);
}

/// `parallel_for` on the current instance. Outside any manual step this
/// parallelizes the loop over the default schedule.
pub fn parallel_for<F>(label: &str, start: i64, end: i64, body: F)
where
    F: Fn(i64) + Send + Sync + 'static,
{
    current().parallel_for(label, start, end, body);
}

/// `collect` on the current instance; see [`Scheduler::collect`].
pub fn collect<T: ReduceValue>(value: T) {
    current().collect(value);
}

/// `pause` on the current instance; see [`Scheduler::pause`].
pub fn pause() -> bool {
    current().pause()
}

/// `yield_now` on the current instance; see [`Scheduler::yield_now`].
pub fn yield_now() {
    current().yield_now();
}
