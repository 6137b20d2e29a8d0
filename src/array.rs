//! Array based queueing lock.
//!
//! The lock is a ring of `N` flags, each on its own cache line, and a ticket
//! counter. Every acquisition draws the next ticket, maps it onto the ring and
//! spins on that slot alone until its predecessor hands the lock over by
//! raising it. Waiters are therefore served in ticket order (FIFO), and each
//! one spins on a line nobody else is spinning on.
//!
//! # Capacity
//!
//! At most `N` threads may be inside [`lock`] at any time. An `N + 1`-th
//! waiter draws a ticket that maps onto a slot whose previous ticket has not
//! lowered it yet, and two threads may then enter the critical section
//! together. This is not detected at runtime, so [`lock`] is `unsafe` and the
//! bound is the caller's obligation. The [`LockRegistry`] meets it by only
//! acquiring array locks from cores pinned in a [`Cpus`] table of at most
//! [`ARRAY_SLOTS`] cores. For the same reason `ArrayLock` does not implement
//! [`RawLock`](crate::lock::RawLock).
//!
//! [`lock`]: ArrayLock::lock
//! [`LockRegistry`]: crate::registry::LockRegistry
//! [`Cpus`]: crate::mcs::per_cpu::Cpus

use core::array;
use core::fmt::{self, Debug, Formatter};
use core::marker::PhantomData;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crossbeam_utils::CachePadded;

use crate::cfg::atomic::{AtomicBool, AtomicUsize};
use crate::relax::{wait_until, Relax};

/// The ring size of the array locks created by the [`LockRegistry`].
///
/// [`LockRegistry`]: crate::registry::LockRegistry
pub const ARRAY_SLOTS: usize = 32;

/// The ring slot a thread was granted the lock on.
///
/// Returned by [`ArrayLock::lock`] and consumed by [`ArrayLock::unlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot(usize);

impl Slot {
    /// Returns the ring index of this slot.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// A FIFO spin lock over a ring of `N` cache-padded flags.
///
/// `N` must be a power of two, so that ticket wrap-around keeps mapping
/// consecutive tickets onto consecutive slots.
///
/// # Example
///
/// ```
/// use cflock::array::ArrayLock;
/// use cflock::relax::Spin;
///
/// let lock = ArrayLock::<4, Spin>::new();
/// // SAFETY: a single thread uses the lock.
/// let slot = unsafe { lock.lock() };
/// assert_eq!(slot.index(), 0);
/// // SAFETY: `slot` was returned by `lock` on this same lock.
/// unsafe { lock.unlock(slot) };
/// // SAFETY: a single thread uses the lock.
/// assert_eq!(unsafe { lock.lock() }.index(), 1);
/// ```
pub struct ArrayLock<const N: usize, R> {
    slots: [CachePadded<AtomicBool>; N],
    ticket: CachePadded<AtomicUsize>,
    relax: PhantomData<R>,
}

// SAFETY: All shared state is atomic.
unsafe impl<const N: usize, R> Send for ArrayLock<N, R> {}
unsafe impl<const N: usize, R> Sync for ArrayLock<N, R> {}

impl<const N: usize, R> ArrayLock<N, R> {
    const VALID_CAPACITY: () = assert!(N.is_power_of_two(), "ring size must be a power of two");

    /// Creates a new, unlocked array lock: slot 0 is raised, every other slot
    /// is lowered and the ticket counter starts at 0.
    #[must_use]
    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::VALID_CAPACITY;
        let slots = array::from_fn(|i| CachePadded::new(AtomicBool::new(i == 0)));
        let ticket = CachePadded::new(AtomicUsize::new(0));
        Self { slots, ticket, relax: PhantomData }
    }

    /// Returns the ring size, which is the maximum number of concurrent
    /// waiters this lock supports.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Returns how many tickets have been drawn so far, modulo `usize`
    /// wrap-around.
    pub fn tickets(&self) -> usize {
        self.ticket.load(Relaxed)
    }

    /// Returns `true` if the lock is held.
    ///
    /// Only exact while no thread is inside [`lock`](ArrayLock::lock): a free
    /// lock has the slot of the next ticket raised.
    pub fn is_locked(&self) -> bool {
        !self.slots[self.tickets() % N].load(Relaxed)
    }
}

impl<const N: usize, R: Relax> ArrayLock<N, R> {
    /// Acquires this lock, spinning on the slot the drawn ticket maps to
    /// until the predecessor raises it.
    ///
    /// The returned [`Slot`] must be given back to [`unlock`].
    ///
    /// # Safety
    ///
    /// At most `N` threads may be executing `lock` on this instance at the
    /// same time. Threads holding the lock do not count.
    ///
    /// [`unlock`]: ArrayLock::unlock
    pub unsafe fn lock(&self) -> Slot {
        let ticket = self.ticket.fetch_add(1, Relaxed);
        let slot = ticket % N;
        let flag = &self.slots[slot];
        wait_until::<R>(|| flag.load(Acquire));
        // Lowered for the ticket that maps onto this slot on the next lap.
        flag.store(false, Relaxed);
        Slot(slot)
    }

    /// Releases this lock by raising the slot that follows `slot`.
    ///
    /// # Safety
    ///
    /// `slot` must have been returned by [`lock`] on this same instance and
    /// not released yet.
    ///
    /// [`lock`]: ArrayLock::lock
    pub unsafe fn unlock(&self, slot: Slot) {
        self.slots[(slot.0 + 1) % N].store(true, Release);
    }
}

impl<const N: usize, R> Default for ArrayLock<N, R> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize, R> Debug for ArrayLock<N, R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayLock")
            .field("capacity", &N)
            .field("tickets", &self.tickets())
            .finish_non_exhaustive()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier, Mutex as StdMutex};
    use std::thread;

    use crate::relax::Yield;

    type ArrayLock<const N: usize> = super::ArrayLock<N, Yield>;

    #[test]
    fn lots_and_lots_lock() {
        const THREADS: usize = 8;
        const ITERS: usize = 1000;
        let lock = Arc::new(ArrayLock::<THREADS>::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let (lock, counter) = (Arc::clone(&lock), Arc::clone(&counter));
                thread::spawn(move || {
                    for _ in 0..ITERS {
                        let slot = unsafe { lock.lock() };
                        let value = counter.load(Ordering::Relaxed);
                        counter.store(value + 1, Ordering::Relaxed);
                        unsafe { lock.unlock(slot) };
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), THREADS * ITERS);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_lock_debug() {
        let lock = ArrayLock::<4>::new();
        let slot = unsafe { lock.lock() };
        assert_eq!(format!("{lock:?}"), "ArrayLock { capacity: 4, tickets: 1, .. }");
        unsafe { lock.unlock(slot) };
    }

    #[test]
    fn slots_follow_tickets_around_the_ring() {
        let lock = ArrayLock::<4>::new();
        for expected in [0, 1, 2, 3, 0, 1] {
            let slot = unsafe { lock.lock() };
            assert_eq!(slot.index(), expected);
            assert!(lock.is_locked());
            unsafe { lock.unlock(slot) };
            assert!(!lock.is_locked());
        }
        assert_eq!(lock.tickets(), 6);
    }

    #[test]
    fn exactly_capacity_waiters_stay_exclusive() {
        // Every thread draws a ticket while the first holder is still inside,
        // so all `N` slots are in use at once.
        const N: usize = 8;
        const ITERS: usize = 200;
        let lock = Arc::new(ArrayLock::<N>::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let counter = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(N));
        let handles: Vec<_> = (0..N)
            .map(|_| {
                let (lock, inside) = (Arc::clone(&lock), Arc::clone(&inside));
                let (counter, barrier) = (Arc::clone(&counter), Arc::clone(&barrier));
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..ITERS {
                        let slot = unsafe { lock.lock() };
                        assert_eq!(inside.fetch_add(1, Ordering::Relaxed), 0);
                        let value = counter.load(Ordering::Relaxed);
                        thread::yield_now();
                        counter.store(value + 1, Ordering::Relaxed);
                        inside.fetch_sub(1, Ordering::Relaxed);
                        unsafe { lock.unlock(slot) };
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), N * ITERS);
        assert_eq!(lock.tickets(), N * ITERS);
    }

    #[test]
    fn grants_in_ticket_order() {
        const WAITERS: usize = 4;
        let lock = Arc::new(ArrayLock::<8>::new());
        let order = Arc::new(StdMutex::new(Vec::new()));
        let held = unsafe { lock.lock() };
        let mut handles = Vec::new();
        for id in 0..WAITERS {
            let (c_lock, c_order) = (Arc::clone(&lock), Arc::clone(&order));
            handles.push(thread::spawn(move || {
                let slot = unsafe { c_lock.lock() };
                c_order.lock().unwrap().push(id);
                unsafe { c_lock.unlock(slot) };
            }));
            // Wait until this waiter has drawn its ticket before spawning the
            // next one.
            while lock.tickets() != id + 2 {
                thread::yield_now();
            }
        }
        unsafe { lock.unlock(held) };
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), (0..WAITERS).collect::<Vec<_>>());
    }
}

#[cfg(all(loom, test))]
mod model {
    use core::array;
    use core::sync::atomic::Ordering::Relaxed;

    use loom::sync::atomic::AtomicUsize;
    use loom::sync::Arc;
    use loom::{model, thread};

    use crate::relax::Yield;

    type ArrayLock = super::ArrayLock<2, Yield>;

    #[test]
    fn lock_join() {
        model(|| {
            const RUNS: usize = 2;
            let lock = Arc::new(ArrayLock::new());
            let count = Arc::new(AtomicUsize::new(0));
            let handles: [_; RUNS] = array::from_fn(|_| {
                let (lock, count) = (Arc::clone(&lock), Arc::clone(&count));
                thread::spawn(move || {
                    // SAFETY: `RUNS` does not exceed the ring size.
                    let slot = unsafe { lock.lock() };
                    let value = count.load(Relaxed);
                    count.store(value + 1, Relaxed);
                    unsafe { lock.unlock(slot) };
                })
            });
            for handle in handles {
                handle.join().unwrap();
            }
            assert_eq!(count.load(Relaxed), RUNS);
        });
    }
}
