//! Per-task reductions.
//!
//! A [`TaskReduction`] carries one accumulator slot per task-local thread
//! id plus the initial value. Loop bodies call `collect` (through the
//! scheduler, which routes the value to the caller's slot); at end of loop
//! the scheduler calls `reduce`, which drains every slot back to the
//! initial value and folds it into the result. Draining is what makes
//! repeated loops over the same reduction (across rounds or across steps)
//! accumulate instead of double-count.
//!
//! The default (and currently only) merge operator is addition.

use crossbeam::utils::CachePadded;
use std::any::Any;
use std::ops::AddAssign;
use std::sync::Mutex;

/// Value types a reduction can merge.
pub trait ReduceValue: Clone + AddAssign + Send + Sync + 'static {}

impl<T: Clone + AddAssign + Send + Sync + 'static> ReduceValue for T {}

/// Type-erased reduction capability stored on a task. `collect` downcasts
/// through `as_any` at the call site, where the element type is known;
/// `reduce` needs no type information and is invoked by `parallel_for`
/// after the end barrier fires.
pub(crate) trait ReduceHandle: Send + Sync {
    fn reduce(&self);
    fn as_any(&self) -> &dyn Any;
}

impl<T: ReduceValue> ReduceHandle for TaskReduction<T> {
    fn reduce(&self) {
        TaskReduction::reduce(self);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct TaskReduction<T> {
    init: T,
    slots: Vec<CachePadded<Mutex<T>>>,
    result: Mutex<T>,
}

impl<T: ReduceValue> TaskReduction<T> {
    /// One slot per participating thread, all starting at `init`.
    pub(crate) fn new(init: T, num_threads: usize) -> Self {
        TaskReduction {
            slots: (0..num_threads)
                .map(|_| CachePadded::new(Mutex::new(init.clone())))
                .collect(),
            result: Mutex::new(init.clone()),
            init,
        }
    }

    /// Adds `value` into the slot for task-local thread `slot`.
    pub(crate) fn collect(&self, value: T, slot: usize) {
        *self.slots[slot].lock().unwrap() += value;
    }

    /// Drains every slot into the result and resets it to the initial
    /// value. Called by the scheduler after the loop's end barrier fires;
    /// must not run concurrently with `collect`.
    pub(crate) fn reduce(&self) {
        let mut result = self.result.lock().unwrap();
        for slot in &self.slots {
            let mut guard = slot.lock().unwrap();
            let value = std::mem::replace(&mut *guard, self.init.clone());
            *result += value;
        }
    }

    /// The merged value so far.
    pub fn get_result(&self) -> T {
        self.result.lock().unwrap().clone()
    }

    pub(crate) fn num_slots(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_and_reduce() {
        let red = TaskReduction::new(0i64, 4);
        for slot in 0..4 {
            red.collect(10, slot);
        }
        red.reduce();
        assert_eq!(red.get_result(), 40);
    }

    #[test]
    fn test_reduce_drains_slots() {
        let red = TaskReduction::new(0i64, 2);
        red.collect(5, 0);
        red.reduce();
        assert_eq!(red.get_result(), 5);

        // A second round must only add the new contributions.
        red.collect(7, 1);
        red.reduce();
        assert_eq!(red.get_result(), 12);

        // An empty round changes nothing.
        red.reduce();
        assert_eq!(red.get_result(), 12);
    }

    #[test]
    fn test_nonzero_init() {
        let red = TaskReduction::new(100i64, 2);
        red.collect(1, 0);
        red.collect(2, 1);
        red.reduce();
        // init + drained slots (each slot starts at init as well).
        assert_eq!(red.get_result(), 303);
    }
}
