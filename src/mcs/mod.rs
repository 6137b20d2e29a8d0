//! Mellor-Crummey and Scott queue lock and its node storage strategies.
//!
//! An MCS lock is a list-based queueing lock. Each waiter appends its own
//! [`QueueNode`] to the queue with a single exchange on the `tail`, then spins
//! on a flag inside that node until its predecessor hands the lock over. The
//! main properties of this mechanism are:
//!
//! - guarantees FIFO ordering of lock acquisitions;
//! - spins on locally-accessible flag variables only;
//! - requires a small constant amount of space per lock; and
//! - needs one queue node per waiter.
//!
//! [`McsQueue`] implements the algorithm over caller supplied nodes. Where
//! those nodes live is what the strategies in this module differ in:
//!
//! | Lock | Node owner | Migration |
//! |---|---|---|
//! | [`PerThreadLock`] | the calling thread, reused across locks | safe |
//! | [`PerCpuLock`] | the logical core the caller is pinned to | requires a [`CpuGuard`] for the whole critical section |
//! | [`TransientLock`] | the `lock` call frame | safe, one extra handoff per acquisition |
//!
//! This algorithm and several others were introduced by the
//! [Mellor-Crummey and Scott] paper.
//!
//! [`PerThreadLock`]: thread_local::PerThreadLock
//! [`PerCpuLock`]: per_cpu::PerCpuLock
//! [`CpuGuard`]: per_cpu::CpuGuard
//! [`TransientLock`]: transient::TransientLock
//! [Mellor-Crummey and Scott]: https://www.cs.rochester.edu/~scott/papers/1991_TOCS_synch.pdf

use core::fmt::{self, Debug, Formatter};
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

use crate::cfg::atomic::AtomicPtr;
use crate::relax::{wait_until, Relax};

mod node;
pub use node::QueueNode;

pub mod per_cpu;
pub mod thread_local;
pub mod transient;

/// The MCS queue: a `tail` pointer to the last queued node, null while the
/// lock is free.
///
/// This is the raw algorithm, the caller provides the nodes. Nodes are only
/// borrowed, so the methods that queue them are `unsafe`: a queued node must
/// neither move nor be dropped until the matching [`unlock`] returns.
///
/// # Example
///
/// ```
/// use cflock::mcs::{McsQueue, QueueNode};
/// use cflock::relax::Spin;
///
/// let queue = McsQueue::<Spin>::new();
/// let node = QueueNode::new();
/// // SAFETY: `node` outlives the acquisition and is not queued elsewhere.
/// unsafe {
///     queue.lock(&node);
///     assert!(queue.is_locked());
///     queue.unlock(&node);
/// }
/// assert!(!queue.is_locked());
/// ```
///
/// [`unlock`]: McsQueue::unlock
pub struct McsQueue<R> {
    tail: AtomicPtr<QueueNode>,
    relax: PhantomData<R>,
}

// SAFETY: All shared state is atomic, and nodes are only dereferenced while
// their owners guarantee they are alive.
unsafe impl<R> Send for McsQueue<R> {}
unsafe impl<R> Sync for McsQueue<R> {}

impl<R> McsQueue<R> {
    /// Creates a new, empty queue (const).
    #[cfg(not(all(loom, test)))]
    #[must_use]
    pub const fn new() -> Self {
        Self { tail: AtomicPtr::new(ptr::null_mut()), relax: PhantomData }
    }

    /// Creates a new, empty Loom based queue (non-const).
    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    #[must_use]
    pub fn new() -> Self {
        Self { tail: AtomicPtr::new(ptr::null_mut()), relax: PhantomData }
    }

    /// Returns `true` if some node is queued, that is, the lock is held.
    ///
    /// The answer may be stale by the time it is observed.
    pub fn is_locked(&self) -> bool {
        !self.tail.load(Relaxed).is_null()
    }

    /// Returns the address of the last queued node.
    #[cfg(all(not(loom), test))]
    pub(crate) fn tail(&self) -> *mut QueueNode {
        self.tail.load(Relaxed)
    }
}

impl<R: Relax> McsQueue<R> {
    /// Appends `node` to the queue and spins until it reaches the head.
    ///
    /// # Safety
    ///
    /// `node` must not be queued on any lock already, and must stay alive at
    /// the same address until it is passed to [`unlock`] on this queue.
    ///
    /// [`unlock`]: McsQueue::unlock
    pub unsafe fn lock(&self, node: &QueueNode) {
        node.next.store(ptr::null_mut(), Relaxed);
        let prev = self.tail.swap(node.as_ptr(), AcqRel);
        if prev.is_null() {
            return;
        }
        // Must be raised before the predecessor can see us.
        node.locked.store(true, Relaxed);
        // SAFETY: `prev` was queued and its owner cannot finish `unlock`
        // before it observes this store.
        unsafe { &*prev }.next.store(node.as_ptr(), Release);
        wait_until::<R>(|| !node.locked.load(Acquire));
    }

    /// Acquires the lock with `node` only if nobody is queued.
    ///
    /// Returns `true` if the lock is now held through `node`.
    ///
    /// # Safety
    ///
    /// Same as [`lock`]. If this returns `false`, `node` was not queued and no
    /// further obligation applies.
    ///
    /// [`lock`]: McsQueue::lock
    #[must_use]
    pub unsafe fn try_lock(&self, node: &QueueNode) -> bool {
        node.next.store(ptr::null_mut(), Relaxed);
        node.locked.store(false, Relaxed);
        self.tail
            .compare_exchange(ptr::null_mut(), node.as_ptr(), AcqRel, Relaxed)
            .is_ok()
    }

    /// Releases the lock held through `node`, handing it to the successor if
    /// one is queued.
    ///
    /// # Safety
    ///
    /// `node` must be the node the current holder acquired this queue with.
    pub unsafe fn unlock(&self, node: &QueueNode) {
        let mut next = node.next.load(Acquire);
        if next.is_null() {
            let swapped = self
                .tail
                .compare_exchange(node.as_ptr(), ptr::null_mut(), Release, Relaxed)
                .is_ok();
            if swapped {
                return;
            }
            // A successor swapped the tail but has not linked itself yet.
            wait_until::<R>(|| {
                next = node.next.load(Acquire);
                !next.is_null()
            });
        }
        // SAFETY: The successor spins on its node until this store, so it is
        // alive here; it is not touched afterwards.
        unsafe { &*next }.locked.store(false, Release);
    }
}

impl<R> Default for McsQueue<R> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Debug for McsQueue<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("McsQueue").field("locked", &self.is_locked()).finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};
    use std::thread;

    use super::QueueNode;
    use crate::relax::Yield;

    type McsQueue = super::McsQueue<Yield>;

    #[test]
    fn try_lock_only_succeeds_on_an_empty_queue() {
        let queue = McsQueue::new();
        let (first, second) = (QueueNode::new(), QueueNode::new());
        unsafe {
            assert!(queue.try_lock(&first));
            assert!(!queue.try_lock(&second));
            queue.unlock(&first);
            assert!(queue.try_lock(&second));
            queue.unlock(&second);
        }
        assert!(!queue.is_locked());
    }

    #[test]
    fn unlock_without_successor_empties_the_queue() {
        let queue = McsQueue::new();
        let node = QueueNode::new();
        unsafe {
            queue.lock(&node);
            assert_eq!(queue.tail(), node.as_ptr());
            queue.unlock(&node);
        }
        assert!(queue.tail().is_null());
    }

    #[test]
    fn grants_in_queue_order() {
        const WAITERS: usize = 4;
        let queue = Arc::new(McsQueue::new());
        let order = Arc::new(StdMutex::new(Vec::new()));
        let head = QueueNode::new();
        unsafe { queue.lock(&head) };
        let mut handles = Vec::new();
        for id in 0..WAITERS {
            let before = queue.tail();
            let (c_queue, c_order) = (Arc::clone(&queue), Arc::clone(&order));
            handles.push(thread::spawn(move || {
                let node = QueueNode::new();
                unsafe { c_queue.lock(&node) };
                c_order.lock().unwrap().push(id);
                unsafe { c_queue.unlock(&node) };
            }));
            // Wait until this waiter has swapped itself into the tail.
            while queue.tail() == before {
                thread::yield_now();
            }
        }
        unsafe { queue.unlock(&head) };
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), (0..WAITERS).collect::<Vec<_>>());
    }

    #[test]
    fn lots_and_lots_with_caller_nodes() {
        const THREADS: usize = 6;
        const ITERS: usize = 1000;
        let queue = Arc::new(McsQueue::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let (queue, counter) = (Arc::clone(&queue), Arc::clone(&counter));
                thread::spawn(move || {
                    // One node reused for every acquisition of this thread.
                    let node = QueueNode::new();
                    for _ in 0..ITERS {
                        unsafe { queue.lock(&node) };
                        let value = counter.load(Ordering::Relaxed);
                        counter.store(value + 1, Ordering::Relaxed);
                        unsafe { queue.unlock(&node) };
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), THREADS * ITERS);
    }
}

#[cfg(all(loom, test))]
mod model {
    use loom::sync::atomic::AtomicUsize;
    use loom::sync::Arc;
    use loom::{model, thread};

    use core::sync::atomic::Ordering::Relaxed;

    use super::QueueNode;
    use crate::relax::Yield;

    type McsQueue = super::McsQueue<Yield>;

    #[test]
    fn lock_join() {
        model(|| {
            const RUNS: usize = 2;
            let queue = Arc::new(McsQueue::new());
            let count = Arc::new(AtomicUsize::new(0));
            let handles: Vec<_> = (0..RUNS)
                .map(|_| {
                    let (queue, count) = (Arc::clone(&queue), Arc::clone(&count));
                    thread::spawn(move || {
                        let node = QueueNode::new();
                        unsafe { queue.lock(&node) };
                        let value = count.load(Relaxed);
                        count.store(value + 1, Relaxed);
                        unsafe { queue.unlock(&node) };
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            assert_eq!(count.load(Relaxed), RUNS);
        });
    }
}
