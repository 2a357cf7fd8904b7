//! Busy-wait helpers shared by the reference counter and the memory pool.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

/// How a busy-wait loop behaves under contention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinPolicy {
    /// Yield the time slice every this many spins.
    pub yield_interval: u32,
    /// Give up after this many spins. `None` waits indefinitely.
    pub retry_limit: Option<u64>,
}

impl SpinPolicy {
    /// Yield every 1024 spins, never give up.
    pub const DEFAULT: Self = Self {
        yield_interval: 1024,
        retry_limit: None,
    };
}

impl Default for SpinPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Counts spins of one wait and applies a [`SpinPolicy`].
#[derive(Debug)]
pub(crate) struct SpinWait {
    policy: SpinPolicy,
    spins: u64,
}

impl SpinWait {
    pub(crate) const fn new(policy: SpinPolicy) -> Self {
        Self { policy, spins: 0 }
    }

    /// Wait a little. Returns `false` once the retry budget is spent.
    pub(crate) fn spin(&mut self) -> bool {
        self.spins += 1;
        if let Some(limit) = self.policy.retry_limit {
            if self.spins > limit {
                return false;
            }
        }
        if self.spins % u64::from(self.policy.yield_interval.max(1)) == 0 {
            std::thread::yield_now();
        } else {
            std::hint::spin_loop();
        }
        true
    }
}

/// Compare-and-swap mutual exclusion over a small critical section.
pub(crate) struct SpinLock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY: access to `value` is serialized by `locked`.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    pub(crate) fn lock(&self) -> SpinGuard<'_, T> {
        let mut wait = SpinWait::new(SpinPolicy::DEFAULT);
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            wait.spin();
        }
        SpinGuard { lock: self }
    }
}

pub(crate) struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock exclusively.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
