//! An exchange based spin lock.
//!
//! The lock is a single shared flag. Waiters read the flag until it looks free
//! and only then retry the exchange, so contended waiters spin on their cached
//! copy of the line instead of hammering it with writes. There is no ordering
//! among waiters: the core that just released the lock often wins it again,
//! which can starve others under heavy contention. Use [`ArrayLock`] or one of
//! the [`mcs`] locks when fairness matters.
//!
//! [`ArrayLock`]: crate::array::ArrayLock
//! [`mcs`]: crate::mcs

use core::fmt::{self, Debug, Formatter};
use core::marker::PhantomData;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crate::cfg::atomic::AtomicBool;
use crate::lock::RawLock;
use crate::relax::{wait_until, Relax};

/// A test-and-test-and-set spin lock with no fairness guarantee.
///
/// # Example
///
/// ```
/// use cflock::relax::Spin;
/// use cflock::spin::SpinLock;
///
/// let lock = SpinLock::<Spin>::new();
/// lock.lock();
/// assert!(!lock.try_lock());
/// // SAFETY: the lock is held by this thread.
/// unsafe { lock.unlock() };
/// assert!(lock.try_lock());
/// ```
pub struct SpinLock<R> {
    locked: AtomicBool,
    relax: PhantomData<R>,
}

// SAFETY: All shared state is atomic.
unsafe impl<R> Send for SpinLock<R> {}
unsafe impl<R> Sync for SpinLock<R> {}

impl<R> SpinLock<R> {
    /// Creates a new, unlocked spin lock.
    #[cfg(not(all(loom, test)))]
    #[must_use]
    pub const fn new() -> Self {
        Self { locked: AtomicBool::new(false), relax: PhantomData }
    }

    /// Creates a new, unlocked, Loom based spin lock (non-const).
    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    #[must_use]
    pub fn new() -> Self {
        Self { locked: AtomicBool::new(false), relax: PhantomData }
    }

    /// Returns `true` if some thread currently holds the lock.
    ///
    /// The answer may be stale by the time it is observed.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Relaxed)
    }
}

impl<R: Relax> SpinLock<R> {
    /// Acquires the lock, spinning with `R` until the flag is exchanged from
    /// free to held.
    pub fn lock(&self) {
        while self.locked.swap(true, Acquire) {
            wait_until::<R>(|| !self.locked.load(Relaxed));
        }
    }

    /// Attempts to acquire the lock with a single exchange.
    ///
    /// Returns `true` if the lock is now held by the caller.
    #[must_use]
    pub fn try_lock(&self) -> bool {
        !self.locked.swap(true, Acquire)
    }

    /// Releases the lock.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock.
    pub unsafe fn unlock(&self) {
        self.locked.store(false, Release);
    }
}

impl<R> Default for SpinLock<R> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Debug for SpinLock<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock").field("locked", &self.is_locked()).finish()
    }
}

// SAFETY: The exchange on `locked` only succeeds for one thread until the
// holder stores `false` again.
unsafe impl<R: Relax> RawLock for SpinLock<R> {
    type Token = ();

    fn new() -> Self {
        Self::new()
    }

    fn lock(&self) {
        self.lock();
    }

    unsafe fn unlock(&self, (): ()) {
        // SAFETY: Caller guaranteed the lock is held.
        unsafe { self.unlock() }
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use crate::relax::Yield;
    use crate::test::tests;

    type SpinLock = super::SpinLock<Yield>;

    #[test]
    fn lots_and_lots_lock() {
        tests::lots_and_lots_lock::<SpinLock>();
    }

    #[test]
    fn smoke() {
        tests::smoke::<SpinLock>();
    }

    #[test]
    fn test_mutex_debug() {
        tests::test_mutex_debug::<SpinLock>();
    }

    #[test]
    fn test_lock_arc_nested() {
        tests::test_lock_arc_nested::<SpinLock, SpinLock>();
    }

    #[test]
    fn test_lock_arc_access_in_unwind() {
        tests::test_lock_arc_access_in_unwind::<SpinLock>();
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new();
        assert!(lock.try_lock());
        assert!(lock.is_locked());
        assert!(!lock.try_lock());
        unsafe { lock.unlock() };
        assert!(!lock.is_locked());
        assert!(lock.try_lock());
        unsafe { lock.unlock() };
    }
}

#[cfg(all(loom, test))]
mod model {
    use crate::loom::models;
    use crate::relax::Yield;

    #[test]
    fn lock_join() {
        models::lock_join::<super::SpinLock<Yield>>();
    }
}
