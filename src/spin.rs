//! Spin-wait primitives.
//!
//! All blocking inside the scheduler core funnels through these three
//! functions. They spin on an atomic cell with acquire loads and a CPU
//! pause hint; the matching stores elsewhere in the crate use release
//! ordering, which is what makes a successful wait a happens-before edge.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// An atomic cell the spin primitives can poll.
///
/// Implemented for the std atomic integer types and `AtomicBool`; the
/// associated `Value` is the plain value type observed by loads.
pub trait AtomicCell {
    type Value: Copy + PartialEq;
    fn load_acquire(&self) -> Self::Value;
}

macro_rules! impl_atomic_cell {
    ($($atomic:ty => $value:ty),* $(,)?) => {
        $(impl AtomicCell for $atomic {
            type Value = $value;
            #[inline]
            fn load_acquire(&self) -> $value {
                self.load(Ordering::Acquire)
            }
        })*
    };
}

impl_atomic_cell! {
    AtomicBool => bool,
    AtomicI32 => i32,
    AtomicI64 => i64,
    AtomicU32 => u32,
    AtomicU64 => u64,
    AtomicUsize => usize,
}

/// Spin until `a` holds exactly `v`.
#[inline]
pub fn wait_until<A: AtomicCell>(a: &A, v: A::Value) {
    while a.load_acquire() != v {
        std::hint::spin_loop();
    }
}

/// Spin while `a` holds `v`; returns the first differing value observed.
#[inline]
pub fn wait_until_not<A: AtomicCell>(a: &A, v: A::Value) -> A::Value {
    loop {
        let observed = a.load_acquire();
        if observed != v {
            return observed;
        }
        std::hint::spin_loop();
    }
}

/// Spin until `a` holds a value `>= v`.
#[inline]
pub fn wait_until_ge<A: AtomicCell>(a: &A, v: A::Value)
where
    A::Value: PartialOrd,
{
    while a.load_acquire() < v {
        std::hint::spin_loop();
    }
}
