//! Lock-free reference counter with lazy construction
//!
//! A [`RefObj`] owns at most one value. The first [`RefObj::acquire`] runs a
//! create hook, the last [`RefObj::release`] runs a destroy hook, and every
//! acquire in between hands out a clone of the published [`Arc`].
//!
//! The counter is a single `AtomicU64`. Bit 63 marks a hook in flight; the
//! low 63 bits hold the live count. While the bit is set every other caller
//! spins (yielding every [`SpinPolicy::yield_interval`] spins) instead of
//! failing, so hooks may block on the driver.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::spin::{SpinPolicy, SpinWait};

const UPDATING: u64 = 1 << 63;
const COUNT_MASK: u64 = UPDATING - 1;

/// Why [`RefObj::acquire`] failed.
#[derive(Debug, Error)]
pub enum AcquireError<E> {
    /// The create hook failed; the count is back at zero.
    #[error("create hook failed: {0}")]
    Create(E),

    /// The 63-bit live count is saturated.
    #[error("reference count overflow")]
    Overflow,

    /// The configured spin budget ran out while a hook was in flight.
    #[error("gave up waiting for a concurrent create or destroy")]
    RetryExhausted,
}

/// Why [`RefObj::release`] failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReleaseError {
    /// Release without a matching acquire.
    #[error("release of an object that is not acquired")]
    NotAcquired,

    /// The configured spin budget ran out while a hook was in flight.
    #[error("gave up waiting for a concurrent create or destroy")]
    RetryExhausted,
}

/// Outcome of a successful release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    /// Other holders remain.
    Decremented,
    /// This was the last holder and the destroy hook ran.
    Destroyed,
}

/// Reference-counted slot with first-acquire / last-release hooks.
pub struct RefObj<T> {
    ref_count: AtomicU64,
    obj: UnsafeCell<Option<Arc<T>>>,
    spin: SpinPolicy,
}

// SAFETY: `obj` is written only by the thread holding the updating sentinel
// and read only after observing a count published with Release ordering by
// that thread. The value itself is shared through `Arc<T>`.
unsafe impl<T: Send + Sync> Sync for RefObj<T> {}
// SAFETY: see above.
unsafe impl<T: Send + Sync> Send for RefObj<T> {}

/// Resets the counter to zero if a hook unwinds.
struct HookGuard<'a> {
    ref_count: &'a AtomicU64,
}

impl Drop for HookGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.ref_count.store(0, Ordering::Release);
        }
    }
}

impl<T> RefObj<T> {
    /// Empty slot with the default spin policy.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_spin_policy(SpinPolicy::DEFAULT)
    }

    /// Empty slot with an explicit spin policy.
    #[must_use]
    pub const fn with_spin_policy(spin: SpinPolicy) -> Self {
        Self {
            ref_count: AtomicU64::new(0),
            obj: UnsafeCell::new(None),
            spin,
        }
    }

    /// Live count. Reads zero while a hook is in flight.
    pub fn ref_count(&self) -> u64 {
        self.ref_count.load(Ordering::Acquire) & COUNT_MASK
    }

    /// True while a create or destroy hook runs.
    pub fn is_updating(&self) -> bool {
        self.ref_count.load(Ordering::Acquire) & UPDATING != 0
    }

    /// Take a reference, constructing the value on the 0 to 1 transition.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError::Create`] with the hook's error (the count is
    /// left at zero), [`AcquireError::Overflow`] if the count is saturated,
    /// or [`AcquireError::RetryExhausted`] under a bounded spin policy.
    pub fn acquire<E, F>(&self, create: F) -> Result<Arc<T>, AcquireError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let mut wait = SpinWait::new(self.spin);
        loop {
            let cur = self.ref_count.load(Ordering::Acquire);
            if cur & UPDATING == 0 {
                if cur == 0 {
                    if self
                        .ref_count
                        .compare_exchange(0, UPDATING, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return self.construct(create);
                    }
                } else if cur == COUNT_MASK {
                    return Err(AcquireError::Overflow);
                } else if self
                    .ref_count
                    .compare_exchange(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    // SAFETY: the count is non-zero and not updating, so the
                    // slot holds the value published before the count and no
                    // writer can run until we release our reference.
                    if let Some(obj) = unsafe { (*self.obj.get()).clone() } {
                        return Ok(obj);
                    }
                }
            }
            if !wait.spin() {
                return Err(AcquireError::RetryExhausted);
            }
        }
    }

    fn construct<E, F>(&self, create: F) -> Result<Arc<T>, AcquireError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let guard = HookGuard {
            ref_count: &self.ref_count,
        };
        let created = create();
        drop(guard);
        match created {
            Ok(value) => {
                let value = Arc::new(value);
                // SAFETY: the updating sentinel excludes every other reader
                // and writer of the slot.
                unsafe { *self.obj.get() = Some(Arc::clone(&value)) };
                self.ref_count.store(1, Ordering::Release);
                Ok(value)
            }
            Err(e) => {
                self.ref_count.store(0, Ordering::Release);
                Err(AcquireError::Create(e))
            }
        }
    }

    /// Drop a reference, running `destroy` on the 1 to 0 transition.
    ///
    /// The slot is already empty when `destroy` runs.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::NotAcquired`] at count zero, or
    /// [`ReleaseError::RetryExhausted`] under a bounded spin policy.
    pub fn release<F>(&self, destroy: F) -> Result<Released, ReleaseError>
    where
        F: FnOnce(Arc<T>),
    {
        let mut wait = SpinWait::new(self.spin);
        loop {
            let cur = self.ref_count.load(Ordering::Acquire);
            if cur & UPDATING == 0 {
                if cur == 0 {
                    return Err(ReleaseError::NotAcquired);
                }
                if cur == 1 {
                    if self
                        .ref_count
                        .compare_exchange(1, UPDATING, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        // SAFETY: we hold the updating sentinel.
                        let obj = unsafe { (*self.obj.get()).take() };
                        let guard = HookGuard {
                            ref_count: &self.ref_count,
                        };
                        if let Some(obj) = obj {
                            destroy(obj);
                        }
                        drop(guard);
                        self.ref_count.store(0, Ordering::Release);
                        return Ok(Released::Destroyed);
                    }
                } else if self
                    .ref_count
                    .compare_exchange(cur, cur - 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(Released::Decremented);
                }
            }
            if !wait.spin() {
                return Err(ReleaseError::RetryExhausted);
            }
        }
    }
}

impl<T> Default for RefObj<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for RefObj<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefObj")
            .field("ref_count", &self.ref_count())
            .field("updating", &self.is_updating())
            .finish_non_exhaustive()
    }
}
