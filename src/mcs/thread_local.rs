//! MCS lock whose queue node lives in the calling thread's local storage.
//!
//! Every thread owns exactly one node, allocated on first use and shared by
//! all the [`PerThreadLock`]s the thread touches. The node travels with the
//! thread, so it stays valid when the scheduler migrates the thread between
//! cores. The price is that a thread can only be queued on one of these locks
//! at a time: acquiring a second `PerThreadLock` while holding (or waiting
//! for) another one would enqueue the same node twice. This is checked at
//! runtime, [`lock`] panics and [`checked_lock`] returns `None`.
//!
//! [`lock`]: PerThreadLock::lock
//! [`checked_lock`]: PerThreadLock::checked_lock

use core::cell::Cell;
use core::fmt::{self, Debug, Formatter};
use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::ptr::NonNull;

use crossbeam_utils::CachePadded;

use super::{McsQueue, QueueNode};
use crate::cfg::thread::thread_local;
use crate::lock::RawLock;
use crate::relax::Relax;

/// The message of the panic raised by nested acquisitions.
macro_rules! node_in_use_error {
    () => {
        "thread local MCS node is already queued on another lock"
    };
}

/// The calling thread's node and whether it is currently queued.
struct ThreadNode {
    node: ManuallyDrop<Box<CachePadded<QueueNode>>>,
    busy: Cell<bool>,
}

impl ThreadNode {
    fn new() -> Self {
        let node = ManuallyDrop::new(Box::new(CachePadded::new(QueueNode::new())));
        Self { node, busy: Cell::new(false) }
    }

    /// Marks the node as queued and returns its address, or `None` if it is
    /// queued already.
    fn claim(&self) -> Option<NonNull<QueueNode>> {
        if self.busy.replace(true) {
            return None;
        }
        let node: &QueueNode = &self.node;
        Some(NonNull::from(node))
    }
}

impl Drop for ThreadNode {
    fn drop(&mut self) {
        // A thread that exits while holding or waiting for a lock leaves its
        // node linked in that lock's queue, so it must outlive the thread.
        if !self.busy.get() {
            // SAFETY: The node is dropped exactly once, here.
            unsafe { ManuallyDrop::drop(&mut self.node) }
        }
    }
}

thread_local! {
    static NODE: ThreadNode = ThreadNode::new();
}

/// Returns `true` if the calling thread's node is queued on some
/// [`PerThreadLock`], that is, the thread holds or is waiting for one.
pub fn node_in_use() -> bool {
    NODE.try_with(|node| node.busy.get()).unwrap_or(true)
}

/// Proof that the calling thread acquired a [`PerThreadLock`].
///
/// The token is neither `Send` nor `Sync`: the lock must be released on the
/// thread that acquired it.
#[must_use = "dropping the token without unlocking leaves the lock held"]
pub struct ThreadToken {
    node: NonNull<QueueNode>,
    thread: PhantomData<*const ()>,
}

impl Debug for ThreadToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadToken").field("node", &self.node).finish()
    }
}

/// An MCS lock that queues the calling thread's own node.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use cflock::mcs::thread_local::PerThreadLock;
/// use cflock::relax::Spin;
///
/// let lock = Arc::new(PerThreadLock::<Spin>::new());
/// let c_lock = Arc::clone(&lock);
///
/// thread::spawn(move || {
///     let token = c_lock.lock();
///     // SAFETY: released on the acquiring thread.
///     unsafe { c_lock.unlock(token) };
/// })
/// .join().expect("thread::spawn failed");
///
/// let token = lock.lock();
/// // SAFETY: released on the acquiring thread.
/// unsafe { lock.unlock(token) };
/// ```
pub struct PerThreadLock<R> {
    queue: McsQueue<R>,
}

impl<R> PerThreadLock<R> {
    /// Creates a new, unlocked lock (const).
    #[cfg(not(all(loom, test)))]
    #[must_use]
    pub const fn new() -> Self {
        Self { queue: McsQueue::new() }
    }

    /// Creates a new, unlocked Loom based lock (non-const).
    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    #[must_use]
    pub fn new() -> Self {
        Self { queue: McsQueue::new() }
    }

    /// Returns `true` if some thread holds the lock.
    pub fn is_locked(&self) -> bool {
        self.queue.is_locked()
    }
}

impl<R: Relax> PerThreadLock<R> {
    /// Acquires this lock with the calling thread's node.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread's node is already queued on another
    /// `PerThreadLock` (nested acquisition), or if the thread local storage
    /// has already been torn down.
    #[track_caller]
    pub fn lock(&self) -> ThreadToken {
        match self.checked_lock() {
            Some(token) => token,
            None => panic!(node_in_use_error!()),
        }
    }

    /// Acquires this lock with the calling thread's node, or returns `None`
    /// without queueing if that node is already in use.
    pub fn checked_lock(&self) -> Option<ThreadToken> {
        let node = NODE.try_with(ThreadNode::claim).ok().flatten()?;
        // SAFETY: The node was just claimed, so it is not queued anywhere,
        // and its heap allocation is never freed while claimed.
        unsafe { self.queue.lock(node.as_ref()) };
        Some(ThreadToken { node, thread: PhantomData })
    }

    /// Releases this lock, handing it to the next queued thread.
    ///
    /// # Safety
    ///
    /// `token` must have been returned by acquiring this same lock.
    pub unsafe fn unlock(&self, token: ThreadToken) {
        // SAFETY: The node stays allocated while claimed, and the caller
        // guaranteed it is queued on this lock.
        unsafe { self.queue.unlock(token.node.as_ref()) };
        // `ThreadToken` is `!Send`, so this is the thread that claimed it.
        let _ = NODE.try_with(|node| node.busy.set(false));
    }
}

impl<R> Default for PerThreadLock<R> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Debug for PerThreadLock<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerThreadLock").field("locked", &self.is_locked()).finish()
    }
}

// SAFETY: Delegates to `McsQueue` with a node that can be claimed by a single
// acquisition at a time.
unsafe impl<R: Relax> RawLock for PerThreadLock<R> {
    type Token = ThreadToken;

    fn new() -> Self {
        Self::new()
    }

    #[track_caller]
    fn lock(&self) -> ThreadToken {
        self.lock()
    }

    unsafe fn unlock(&self, token: ThreadToken) {
        // SAFETY: Caller guaranteed `token` belongs to this lock and thread.
        unsafe { self.unlock(token) }
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::Arc;
    use std::thread;

    use crate::mutex::Mutex;
    use crate::relax::Yield;
    use crate::test::tests;

    type PerThreadLock = super::PerThreadLock<Yield>;

    #[test]
    fn lots_and_lots_lock() {
        tests::lots_and_lots_lock::<PerThreadLock>();
    }

    #[test]
    fn smoke() {
        tests::smoke::<PerThreadLock>();
    }

    #[test]
    fn test_mutex_debug() {
        tests::test_mutex_debug::<PerThreadLock>();
    }

    #[test]
    fn test_lock_arc_access_in_unwind() {
        tests::test_lock_arc_access_in_unwind::<PerThreadLock>();
    }

    #[test]
    #[should_panic = "thread local MCS node is already queued on another lock"]
    fn nested_acquisition_panics() {
        let outer = Mutex::<_, PerThreadLock>::new(1);
        outer.lock_with(|_guard| {
            let inner = Mutex::<_, PerThreadLock>::new(());
            inner.lock_with(|_guard| ());
        });
    }

    #[test]
    fn checked_lock_reports_node_in_use() {
        let (outer, inner) = (PerThreadLock::new(), PerThreadLock::new());
        assert!(!super::node_in_use());
        let token = outer.lock();
        assert!(super::node_in_use());
        assert!(inner.checked_lock().is_none());
        assert!(!inner.is_locked());
        unsafe { outer.unlock(token) };
        assert!(!super::node_in_use());
    }

    #[test]
    fn node_is_reused_across_locks() {
        let (first, second) = (PerThreadLock::new(), PerThreadLock::new());
        for _ in 0..3 {
            let token = first.lock();
            unsafe { first.unlock(token) };
            let token = second.lock();
            unsafe { second.unlock(token) };
        }
        assert!(!first.is_locked());
        assert!(!second.is_locked());
    }

    #[test]
    fn each_thread_has_its_own_node() {
        let lock = Arc::new(PerThreadLock::new());
        let token = lock.lock();
        let held = token.node.as_ptr();
        let c_lock = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            assert!(!super::node_in_use());
            let token = c_lock.lock();
            unsafe { c_lock.unlock(token) };
        });
        // Wait for the other thread to queue its own node behind ours.
        while !handle.is_finished() && lock.queue.tail() == held {
            thread::yield_now();
        }
        unsafe { lock.unlock(token) };
        handle.join().unwrap();
        assert!(!lock.is_locked());
    }
}
