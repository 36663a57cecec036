//! Resumable execution contexts for coroutine tasks.
//!
//! A [`FiberRunner`] hosts one task body at a time on a stackful coroutine
//! and lets it suspend from arbitrarily deep inside the body via
//! [`suspend`]. The runner stays on the thread that owns its subtask, so
//! pinning and thread-local scheduler state carry through suspension
//! points unchanged.

use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::cell::Cell;

type FiberCoroutine = Coroutine<(), (), ()>;
type FiberYielder = Yielder<(), ()>;

thread_local! {
    // Yielder of the fiber currently executing on this thread, or null when
    // control is on the plain worker stack. Cleared across suspensions so a
    // nested body started while another fiber is parked sees only itself.
    static CURRENT_YIELDER: Cell<*const FiberYielder> = const { Cell::new(std::ptr::null()) };
}

/// True while the calling code is executing inside a fiber body.
pub(crate) fn in_fiber() -> bool {
    !CURRENT_YIELDER.with(Cell::get).is_null()
}

/// Suspends the fiber currently executing on this thread, returning control
/// to whoever resumed it. Returns when the fiber is continued.
///
/// Panics if called outside a fiber body.
pub(crate) fn suspend() {
    let yielder = CURRENT_YIELDER.with(Cell::get);
    assert!(!yielder.is_null(), "suspend() called outside a fiber body");
    CURRENT_YIELDER.with(|c| c.set(std::ptr::null()));
    // SAFETY: `yielder` belongs to the fiber running right now on this
    // thread; it stays valid until that fiber returns, and the fiber cannot
    // return while suspended inside it.
    unsafe {
        (*yielder).suspend(());
    }
    CURRENT_YIELDER.with(|c| c.set(yielder));
}

/// A reusable shell hosting one coroutine body at a time.
///
/// `run` installs a body, `cont` starts or resumes it, `is_finished`
/// reports whether the body has returned. A runner must be finished before
/// a new body is installed or before it is returned to the pool.
pub(crate) struct FiberRunner {
    coroutine: Option<FiberCoroutine>,
    finished: bool,
}

// SAFETY: a runner is created, resumed and dropped only by the STS thread
// that owns the subtask holding it; the containing structures hand it out
// under that discipline. The coroutine itself never migrates mid-flight.
unsafe impl Send for FiberRunner {}

impl FiberRunner {
    pub(crate) fn new() -> Self {
        FiberRunner {
            coroutine: None,
            finished: true,
        }
    }

    /// Installs a new body. The previous body must have finished.
    pub(crate) fn run<F>(&mut self, body: F)
    where
        F: FnOnce() + 'static,
    {
        assert!(
            self.finished,
            "FiberRunner::run called while a body is still in flight"
        );
        self.coroutine = Some(Coroutine::new(move |yielder, ()| {
            let prev = CURRENT_YIELDER.with(|c| c.replace(yielder as *const _));
            body();
            CURRENT_YIELDER.with(|c| c.set(prev));
        }));
        self.finished = false;
    }

    /// Starts or resumes the installed body. Returns `true` when the body
    /// has run to completion.
    pub(crate) fn cont(&mut self) -> bool {
        let coroutine = self
            .coroutine
            .as_mut()
            .expect("FiberRunner::cont with no body installed");
        match coroutine.resume(()) {
            CoroutineResult::Yield(()) => false,
            CoroutineResult::Return(()) => {
                self.finished = true;
                self.coroutine = None;
                true
            }
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }
}
