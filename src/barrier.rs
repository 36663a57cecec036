//! Barrier flavors used to coordinate threads within and across tasks.
//!
//! Four shapes, all built on the spin primitives:
//!
//! - [`MOBarrier`]: many waiters, one opener (a latch).
//! - [`OMBarrier`]: many arrivers counted down, one waiter.
//! - [`MMBarrier`]: a reusable N-party barrier usable inside a loop.
//! - [`RMOBarrier`]: a reusable many-to-one barrier keyed by waiter id.
//!
//! Instances may be named; a named instance registers itself in a
//! process-wide map at construction and deregisters when dropped, so
//! separately-compiled modules can rendezvous on a string.

use crate::spin::{wait_until, wait_until_ge};
use crossbeam::utils::{Backoff, CachePadded};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

struct Registry<T> {
    map: Mutex<HashMap<String, Weak<T>>>,
}

impl<T> Registry<T> {
    fn new() -> Self {
        Registry {
            map: Mutex::new(HashMap::new()),
        }
    }

    fn register(&self, name: &str, value: &Arc<T>) {
        let mut map = self.map.lock().unwrap();
        map.insert(name.to_string(), Arc::downgrade(value));
    }

    fn lookup(&self, name: &str) -> Option<Arc<T>> {
        let map = self.map.lock().unwrap();
        map.get(name).and_then(Weak::upgrade)
    }

    fn deregister(&self, name: &str) {
        let mut map = self.map.lock().unwrap();
        // Only prune if the entry is actually dead; a new instance may have
        // taken the name already.
        if let Some(w) = map.get(name) {
            if w.upgrade().is_none() {
                map.remove(name);
            }
        }
    }
}

lazy_static::lazy_static! {
    static ref MO_REGISTRY: Registry<MOBarrier> = Registry::new();
    static ref OM_REGISTRY: Registry<OMBarrier> = Registry::new();
    static ref MM_REGISTRY: Registry<MMBarrier> = Registry::new();
    static ref RMO_REGISTRY: Registry<RMOBarrier> = Registry::new();
}

/// Many-to-one latch: one thread opens, any number of threads wait.
pub struct MOBarrier {
    locked: AtomicBool,
    name: Option<String>,
}

impl MOBarrier {
    pub fn new() -> Self {
        MOBarrier {
            locked: AtomicBool::new(true),
            name: None,
        }
    }

    pub fn new_named(name: &str) -> Arc<Self> {
        let b = Arc::new(MOBarrier {
            locked: AtomicBool::new(true),
            name: Some(name.to_string()),
        });
        MO_REGISTRY.register(name, &b);
        b
    }

    pub fn lookup(name: &str) -> Option<Arc<Self>> {
        MO_REGISTRY.lookup(name)
    }

    /// Blocks until the barrier is opened.
    pub fn wait(&self) {
        wait_until(&self.locked, false);
    }

    /// Releases all current and future waiters.
    pub fn open(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Re-latches the barrier.
    pub fn close(&self) {
        self.locked.store(true, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        !self.locked.load(Ordering::Acquire)
    }
}

impl Default for MOBarrier {
    fn default() -> Self {
        MOBarrier::new()
    }
}

impl Drop for MOBarrier {
    fn drop(&mut self) {
        if let Some(name) = &self.name {
            MO_REGISTRY.deregister(name);
        }
    }
}

/// One-to-many arrival counter: `close(n)` arms it, `n` arrivals open it.
pub struct OMBarrier {
    remaining: AtomicI32,
    name: Option<String>,
}

impl OMBarrier {
    pub fn new() -> Self {
        OMBarrier {
            remaining: AtomicI32::new(0),
            name: None,
        }
    }

    pub fn new_named(name: &str) -> Arc<Self> {
        let b = Arc::new(OMBarrier {
            remaining: AtomicI32::new(0),
            name: Some(name.to_string()),
        });
        OM_REGISTRY.register(name, &b);
        b
    }

    pub fn lookup(name: &str) -> Option<Arc<Self>> {
        OM_REGISTRY.lookup(name)
    }

    /// Registers one arrival.
    pub fn mark_arrival(&self) {
        self.remaining.fetch_sub(1, Ordering::AcqRel);
    }

    /// Raises the expected arrival count mid-flight. Used when a thread
    /// steals work and becomes an extra participant.
    pub fn add_thread(&self) {
        self.remaining.fetch_add(1, Ordering::AcqRel);
    }

    /// Blocks until all expected arrivals have happened.
    pub fn wait(&self) {
        let backoff = Backoff::new();
        while self.remaining.load(Ordering::Acquire) > 0 {
            backoff.snooze();
        }
    }

    /// Arms the barrier for `n` arrivals.
    pub fn close(&self, n: i32) {
        self.remaining.store(n, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.remaining.load(Ordering::Acquire) <= 0
    }
}

impl Default for OMBarrier {
    fn default() -> Self {
        OMBarrier::new()
    }
}

impl Drop for OMBarrier {
    fn drop(&mut self) {
        if let Some(name) = &self.name {
            OM_REGISTRY.deregister(name);
        }
    }
}

/// Reusable many-to-many barrier for a fixed set of exactly `n` threads.
///
/// Works inside a loop with no external reset. The `enter` sequence
/// (wait on released, bump waiting, wait on waiting, bump released) must
/// not be reordered: the leading wait keeps a fast thread from re-entering
/// the next round before the last thread of this round has left.
pub struct MMBarrier {
    nthreads: i32,
    waiting: AtomicI32,
    released: AtomicI32,
    name: Option<String>,
}

impl MMBarrier {
    pub fn new(nthreads: usize) -> Self {
        assert!(nthreads > 0, "MMBarrier needs at least one thread");
        MMBarrier {
            nthreads: nthreads as i32,
            waiting: AtomicI32::new(0),
            released: AtomicI32::new(0),
            name: None,
        }
    }

    pub fn new_named(nthreads: usize, name: &str) -> Arc<Self> {
        assert!(nthreads > 0, "MMBarrier needs at least one thread");
        let b = Arc::new(MMBarrier {
            nthreads: nthreads as i32,
            waiting: AtomicI32::new(0),
            released: AtomicI32::new(0),
            name: Some(name.to_string()),
        });
        MM_REGISTRY.register(name, &b);
        b
    }

    pub fn lookup(name: &str) -> Option<Arc<Self>> {
        MM_REGISTRY.lookup(name)
    }

    pub fn enter(&self) {
        wait_until(&self.released, 0);
        self.waiting.fetch_add(1, Ordering::AcqRel);
        wait_until(&self.waiting, self.nthreads);
        if self.released.fetch_add(1, Ordering::AcqRel) == self.nthreads - 1 {
            // Last thread out resets for the next round.
            self.waiting.store(0, Ordering::Release);
            self.released.store(0, Ordering::Release);
        }
    }
}

impl Drop for MMBarrier {
    fn drop(&mut self) {
        if let Some(name) = &self.name {
            MM_REGISTRY.deregister(name);
        }
    }
}

/// Reusable many-to-one barrier keyed by waiter id.
///
/// Each `open` raises a monotone counter; each waiter tracks how many
/// opens it has consumed, so a waiter can come back for the next round
/// without any reset step.
pub struct RMOBarrier {
    locks_opened: AtomicU64,
    lock_num: Vec<CachePadded<AtomicU64>>,
    name: Option<String>,
}

impl RMOBarrier {
    pub fn new(num_waiters: usize) -> Self {
        RMOBarrier {
            locks_opened: AtomicU64::new(0),
            lock_num: (0..num_waiters)
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
            name: None,
        }
    }

    pub fn new_named(num_waiters: usize, name: &str) -> Arc<Self> {
        let b = Arc::new(RMOBarrier {
            locks_opened: AtomicU64::new(0),
            lock_num: (0..num_waiters)
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
            name: Some(name.to_string()),
        });
        RMO_REGISTRY.register(name, &b);
        b
    }

    pub fn lookup(name: &str) -> Option<Arc<Self>> {
        RMO_REGISTRY.lookup(name)
    }

    /// Releases one round of waiters.
    pub fn open(&self) {
        self.locks_opened.fetch_add(1, Ordering::Release);
    }

    /// Blocks waiter `id` until the next unconsumed open.
    pub fn wait(&self, id: usize) {
        let target = self.lock_num[id].fetch_add(1, Ordering::Relaxed) + 1;
        wait_until_ge(&self.locks_opened, target);
    }
}

impl Drop for RMOBarrier {
    fn drop(&mut self) {
        if let Some(name) = &self.name {
            RMO_REGISTRY.deregister(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_mo_barrier_latch() {
        let b = Arc::new(MOBarrier::new());
        assert!(!b.is_open());

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let b = b.clone();
                thread::spawn(move || b.wait())
            })
            .collect();

        b.open();
        for w in waiters {
            w.join().unwrap();
        }
        assert!(b.is_open());
        b.close();
        assert!(!b.is_open());
    }

    #[test]
    fn test_om_barrier_counts_arrivals() {
        let b = Arc::new(OMBarrier::new());
        b.close(4);
        assert!(!b.is_open());

        let arrivers: Vec<_> = (0..4)
            .map(|_| {
                let b = b.clone();
                thread::spawn(move || b.mark_arrival())
            })
            .collect();
        for a in arrivers {
            a.join().unwrap();
        }
        b.wait();
        assert!(b.is_open());
    }

    #[test]
    fn test_mm_barrier_reusable_rounds() {
        const N: usize = 4;
        const ROUNDS: usize = 50;
        let b = Arc::new(MMBarrier::new(N));
        let phase = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..N)
            .map(|_| {
                let b = b.clone();
                let phase = phase.clone();
                thread::spawn(move || {
                    for round in 0..ROUNDS {
                        b.enter();
                        // Every thread must observe the same round; a leak
                        // past a round boundary would show up here.
                        let seen = phase.load(Ordering::SeqCst);
                        assert!(seen == round || seen == round + 1);
                        b.enter();
                        phase.store(round + 1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(phase.load(Ordering::SeqCst), ROUNDS);
    }

    #[test]
    fn test_rmo_barrier_reentry() {
        let b = Arc::new(RMOBarrier::new(2));
        let b2 = b.clone();

        let waiter = thread::spawn(move || {
            for _ in 0..3 {
                b2.wait(0);
            }
        });

        for _ in 0..3 {
            b.open();
        }
        waiter.join().unwrap();
    }

    #[test]
    fn test_named_registry_lookup_and_drop() {
        {
            let b = OMBarrier::new_named("test-om-registry");
            b.close(1);
            let found = OMBarrier::lookup("test-om-registry").expect("registered");
            found.mark_arrival();
            b.wait();
        }
        assert!(OMBarrier::lookup("test-om-registry").is_none());
    }
}
