//! Worker threads and per-thread scheduler state.
//!
//! Every pool slot beyond the main thread gets one long-lived OS thread
//! that loops on the global step counter and drains its assigned subtask
//! queue each step. Thread-local state carries the STS thread id, the
//! stack of subtasks currently executing on this thread (coroutine pause
//! targets and nested loops make this a real stack), and the pinned core.

use crate::runtime::Runtime;
use crate::task::{SubTask, Task};
use crate::trace;
use core_affinity::CoreId;
use std::cell::{Cell, RefCell};
use std::sync::Arc;

pub(crate) struct StackFrame {
    pub pos: usize,
    pub task: Arc<Task>,
    pub sub: Arc<SubTask>,
}

thread_local! {
    // 0 is the main thread; worker threads overwrite this at startup.
    static STS_THREAD_ID: Cell<usize> = const { Cell::new(0) };
    static CALL_STACK: RefCell<Vec<StackFrame>> = const { RefCell::new(Vec::new()) };
}

/// STS thread id of the calling thread.
pub fn thread_id() -> usize {
    STS_THREAD_ID.with(Cell::get)
}

pub(crate) fn set_thread_id(id: usize) {
    STS_THREAD_ID.with(|c| c.set(id));
}

pub(crate) fn push_frame(pos: usize, task: Arc<Task>, sub: Arc<SubTask>) {
    CALL_STACK.with(|s| s.borrow_mut().push(StackFrame { pos, task, sub }));
}

pub(crate) fn pop_frame() {
    CALL_STACK.with(|s| {
        s.borrow_mut().pop().expect("subtask call stack underflow");
    });
}

/// Queue position, task and subtask on top of this thread's call stack.
pub(crate) fn stack_top() -> Option<(usize, Arc<Task>, Arc<SubTask>)> {
    CALL_STACK.with(|s| {
        s.borrow()
            .last()
            .map(|f| (f.pos, Arc::clone(&f.task), Arc::clone(&f.sub)))
    })
}

/// Task of the subtask currently running on this thread, if any.
pub(crate) fn current_task() -> Option<Arc<Task>> {
    CALL_STACK.with(|s| s.borrow().last().map(|f| Arc::clone(&f.task)))
}

/// Whether queue position `pos` is anywhere on this thread's call stack.
pub(crate) fn on_stack(pos: usize) -> bool {
    CALL_STACK.with(|s| s.borrow().iter().any(|f| f.pos == pos))
}

/// Body of one worker thread.
///
/// Spins on the step counter; a negative value is the shutdown signal.
/// Each observed step drains this thread's queue of the instance the step
/// was published for, then marks the step-completion barrier.
pub(crate) fn worker_main(id: usize, runtime: Arc<Runtime>, core: Option<CoreId>) {
    set_thread_id(id);
    if let Some(core_id) = core {
        core_affinity::set_for_current(core_id);
    }
    log::trace!("worker {} up (core {:?})", id, core.map(|c| c.id));

    let mut step = 0i64;
    loop {
        let c = runtime.wait_on_step_counter(step);
        if c < 0 {
            break;
        }
        step = c;
        let sched = runtime.current();
        sched.process_queue(id);
        runtime.mark_step_complete();
    }

    trace::collect_local_trace();
    log::trace!("worker {} down", id);
}
