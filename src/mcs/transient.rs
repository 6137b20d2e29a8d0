//! MCS lock whose queue node only lives for the duration of the `lock` call.
//!
//! The MCS queue here is not the lock itself but a gate in front of it. A
//! caller queues a node on its own stack frame, and once at the head of the
//! queue it waits for the shared `held` flag to clear, raises it and leaves
//! the queue before returning. The lock is then held through `held` alone,
//! and no node outlives the acquisition, so the strategy is safe under
//! migration and nesting. The cost is an extra handoff per acquisition,
//! and waiters behind the gate spin on their own nodes while the head of the
//! queue spins on `held`.

use core::fmt::{self, Debug, Formatter};
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use super::{McsQueue, QueueNode};
use crate::cfg::atomic::AtomicBool;
use crate::lock::RawLock;
use crate::relax::{wait_until, Relax};

/// An MCS gated lock that needs no node storage beyond the `lock` call.
///
/// # Example
///
/// ```
/// use cflock::mcs::transient::TransientLock;
/// use cflock::relax::Spin;
///
/// let outer = TransientLock::<Spin>::new();
/// let inner = TransientLock::<Spin>::new();
/// outer.lock();
/// // Nested acquisitions are fine, no node stays queued.
/// inner.lock();
/// // SAFETY: both locks are held by this thread.
/// unsafe {
///     inner.unlock();
///     outer.unlock();
/// }
/// ```
pub struct TransientLock<R> {
    queue: McsQueue<R>,
    held: AtomicBool,
}

impl<R> TransientLock<R> {
    /// Creates a new, unlocked lock (const).
    #[cfg(not(all(loom, test)))]
    #[must_use]
    pub const fn new() -> Self {
        Self { queue: McsQueue::new(), held: AtomicBool::new(false) }
    }

    /// Creates a new, unlocked Loom based lock (non-const).
    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    #[must_use]
    pub fn new() -> Self {
        Self { queue: McsQueue::new(), held: AtomicBool::new(false) }
    }

    /// Returns `true` if some thread holds the lock.
    pub fn is_locked(&self) -> bool {
        self.held.load(Relaxed)
    }
}

impl<R: Relax> TransientLock<R> {
    /// Acquires this lock, queueing a node on this call's frame until the
    /// holder releases.
    pub fn lock(&self) {
        let node = QueueNode::new();
        // SAFETY: `node` lives on this frame until the matching `unlock`
        // below, and it is a fresh node that is not queued anywhere.
        unsafe { self.queue.lock(&node) };
        wait_until::<R>(|| !self.held.load(Acquire));
        // Only the head of the gate writes `held = true`.
        self.held.store(true, Relaxed);
        // SAFETY: `node` is the node this frame acquired the gate with.
        unsafe { self.queue.unlock(&node) };
    }

    /// Releases this lock.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock.
    pub unsafe fn unlock(&self) {
        self.held.store(false, Release);
    }
}

impl<R> Default for TransientLock<R> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Debug for TransientLock<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransientLock")
            .field("held", &self.is_locked())
            .field("waiting", &self.queue.is_locked())
            .finish()
    }
}

// SAFETY: `held` is only raised by the head of the gate after observing it
// cleared, and the gate admits one node at a time.
unsafe impl<R: Relax> RawLock for TransientLock<R> {
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

    type TransientLock = super::TransientLock<Yield>;

    #[test]
    fn lots_and_lots_lock() {
        tests::lots_and_lots_lock::<TransientLock>();
    }

    #[test]
    fn smoke() {
        tests::smoke::<TransientLock>();
    }

    #[test]
    fn test_mutex_debug() {
        tests::test_mutex_debug::<TransientLock>();
    }

    #[test]
    fn test_lock_arc_nested() {
        tests::test_lock_arc_nested::<TransientLock, TransientLock>();
    }

    #[test]
    fn test_acquire_more_than_one_lock() {
        tests::test_acquire_more_than_one_lock::<TransientLock>();
    }

    #[test]
    fn test_lock_arc_access_in_unwind() {
        tests::test_lock_arc_access_in_unwind::<TransientLock>();
    }

    #[test]
    fn gate_is_empty_while_held() {
        let lock = TransientLock::new();
        lock.lock();
        assert!(lock.is_locked());
        assert!(!lock.queue.is_locked());
        unsafe { lock.unlock() };
        assert!(!lock.is_locked());
    }
}

#[cfg(all(loom, test))]
mod model {
    use crate::loom::models;
    use crate::relax::Yield;

    #[test]
    fn lock_join() {
        models::lock_join::<super::TransientLock<Yield>>();
    }
}
