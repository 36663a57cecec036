//! Pooling of fiber runners.
//!
//! Runner shells are pooled per scheduler thread so coroutine tasks reuse
//! them across steps instead of re-allocating. The free lists are sharded
//! by slot; threads that stick to their own slot never contend on a lock.

use crate::fiber::FiberRunner;
use std::sync::Mutex;

pub(crate) struct FiberPool {
    slots: Vec<Mutex<Vec<FiberRunner>>>,
}

impl FiberPool {
    pub(crate) fn new(num_slots: usize) -> Self {
        FiberPool {
            slots: (0..num_slots).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    /// Checks out a runner for the given slot, constructing one if the
    /// free list is empty.
    pub(crate) fn get(&self, slot: usize) -> FiberRunner {
        let mut list = self.slots[slot].lock().unwrap();
        list.pop().unwrap_or_else(FiberRunner::new)
    }

    /// Hands a runner back. The runner must have finished its body.
    pub(crate) fn release(&self, slot: usize, runner: FiberRunner) {
        assert!(
            runner.is_finished(),
            "released a fiber runner with a body still in flight"
        );
        self.slots[slot].lock().unwrap().push(runner);
    }

    /// Number of idle runners in a slot.
    #[allow(dead_code)]
    pub(crate) fn available(&self, slot: usize) -> usize {
        self.slots[slot].lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_constructs_on_empty() {
        let pool = FiberPool::new(2);
        assert_eq!(pool.available(0), 0);
        let runner = pool.get(0);
        assert!(runner.is_finished());
        pool.release(0, runner);
        assert_eq!(pool.available(0), 1);
    }

    #[test]
    fn test_release_and_reuse() {
        let pool = FiberPool::new(1);
        let mut runner = pool.get(0);
        runner.run(|| {});
        assert!(runner.cont());
        pool.release(0, runner);
        assert_eq!(pool.available(0), 1);

        let _again = pool.get(0);
        assert_eq!(pool.available(0), 0);
    }

    #[test]
    #[should_panic(expected = "still in flight")]
    fn test_release_unfinished_panics() {
        let pool = FiberPool::new(1);
        let mut runner = pool.get(0);
        runner.run(|| crate::fiber::suspend());
        runner.cont();
        pool.release(0, runner);
    }
}
