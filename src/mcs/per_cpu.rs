//! MCS lock whose queue node belongs to the logical core the caller runs on.
//!
//! A per-core node is only correct if the task using it cannot be preempted
//! or migrated between acquiring and releasing the lock: another task running
//! on the same core would reuse a node that is still queued, and a task that
//! moved to another core would release through the wrong node. Inside a kernel
//! that is what disabling preemption guarantees. Here the guarantee is
//! modelled by [`Cpus`], a table of logical cores, and [`CpuGuard`], the proof
//! that the caller occupies one of them exclusively.
//!
//! [`PerCpuLock`] can only be acquired through a `CpuGuard`, and it uses the
//! node of that guard's core. Holding the guard for the whole
//! acquire, critical section and release window is the caller's obligation
//! and is enforced by the borrow of the guard in [`CpuToken`].

use core::fmt::{self, Debug, Formatter};
use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crossbeam_utils::CachePadded;

use super::{McsQueue, QueueNode};
use crate::cfg::atomic::AtomicBool;
use crate::relax::{wait_until, Relax, Spin};

/// The message of the panic raised by nested acquisitions.
macro_rules! node_in_use_error {
    () => {
        "per-cpu MCS node is already queued on another lock"
    };
}

/// One logical core: its MCS node, whether the node is queued on some lock
/// and whether a task occupies the core.
///
/// `queued` is only touched by the task occupying the core, and pinning
/// orders successive occupants, so it outlives any single [`CpuGuard`].
struct Cpu {
    node: QueueNode,
    queued: AtomicBool,
    occupied: AtomicBool,
}

impl Cpu {
    fn new() -> Self {
        Self { node: QueueNode::new(), queued: AtomicBool::new(false), occupied: AtomicBool::new(false) }
    }
}

/// A fixed set of logical cores, each owning one MCS [`QueueNode`].
///
/// # Example
///
/// ```
/// use cflock::mcs::per_cpu::{Cpus, PerCpuLock};
/// use cflock::relax::Spin;
///
/// let cpus = Cpus::new(2);
/// let lock = PerCpuLock::<Spin>::new();
///
/// let pin = cpus.pin(1);
/// let token = lock.lock(&pin);
/// // SAFETY: `token` was returned by `lock` on this same lock.
/// unsafe { lock.unlock(token) };
/// drop(pin);
/// ```
pub struct Cpus {
    cpus: ManuallyDrop<Box<[CachePadded<Cpu>]>>,
}

impl Cpus {
    /// Creates `count` logical cores, none of them occupied.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero.
    #[must_use]
    pub fn new(count: usize) -> Self {
        assert!(count > 0, "at least one logical core is required");
        let cpus = (0..count).map(|_| CachePadded::new(Cpu::new())).collect();
        Self { cpus: ManuallyDrop::new(cpus) }
    }

    /// Returns the number of logical cores.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    /// Always `false`, there is at least one core.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Occupies core `cpu`, spinning until the task currently running on it
    /// leaves.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` is not smaller than [`len`](Cpus::len).
    pub fn pin(&self, cpu: usize) -> CpuGuard<'_> {
        self.pin_with::<Spin>(cpu)
    }

    /// Same as [`pin`](Cpus::pin), relaxing with `R` while the core is
    /// occupied.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` is not smaller than [`len`](Cpus::len).
    pub fn pin_with<R: Relax>(&self, cpu: usize) -> CpuGuard<'_> {
        let occupied = &self.cpus[cpu].occupied;
        loop {
            if let Some(guard) = self.try_pin(cpu) {
                return guard;
            }
            wait_until::<R>(|| !occupied.load(Relaxed));
        }
    }

    /// Occupies core `cpu` if no task is running on it.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` is not smaller than [`len`](Cpus::len).
    pub fn try_pin(&self, cpu: usize) -> Option<CpuGuard<'_>> {
        let entry = &self.cpus[cpu];
        entry
            .occupied
            .compare_exchange(false, true, Acquire, Relaxed)
            .ok()
            .map(|_| CpuGuard { cpus: self, cpu, thread: PhantomData })
    }

    /// Returns `true` if some task occupies core `cpu`.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` is not smaller than [`len`](Cpus::len).
    pub fn is_pinned(&self, cpu: usize) -> bool {
        self.cpus[cpu].occupied.load(Relaxed)
    }

    /// Returns `true` if the node of core `cpu` is queued on some
    /// [`PerCpuLock`], whether or not a task occupies the core now.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` is not smaller than [`len`](Cpus::len).
    pub fn is_queued(&self, cpu: usize) -> bool {
        self.cpus[cpu].queued.load(Relaxed)
    }
}

impl Drop for Cpus {
    fn drop(&mut self) {
        // A node whose token was dropped without unlocking stays linked in
        // that lock's queue, so the table must outlive every such lock.
        if !self.cpus.iter().any(|cpu| cpu.queued.load(Relaxed)) {
            // SAFETY: The table is dropped exactly once, here.
            unsafe { ManuallyDrop::drop(&mut self.cpus) }
        }
    }
}

impl Debug for Cpus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cpus").field("len", &self.len()).finish()
    }
}

/// Exclusive occupation of one logical core of a [`Cpus`] table.
///
/// While the guard lives, no other task can pin the same core, which is the
/// equivalent of running with preemption disabled. The core is left when the
/// guard is dropped. The guard is `!Send`: a pinned task does not migrate.
#[must_use = "the core is left as soon as the guard is dropped"]
pub struct CpuGuard<'a> {
    cpus: &'a Cpus,
    cpu: usize,
    thread: PhantomData<*const ()>,
}

impl<'a> CpuGuard<'a> {
    /// Returns the index of the occupied core.
    #[must_use]
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// Returns `true` if this guard was pinned from `cpus`.
    #[must_use]
    pub fn belongs_to(&self, cpus: &Cpus) -> bool {
        core::ptr::eq(self.cpus, cpus)
    }

    /// Returns `true` if this core's node is queued on some [`PerCpuLock`].
    ///
    /// The node stays queued after its [`CpuToken`] is dropped without
    /// unlocking, across any number of later pins of the same core.
    #[must_use]
    pub fn node_in_use(&self) -> bool {
        self.cpus.is_queued(self.cpu)
    }

    /// Marks the core's node as queued and returns it, or `None` if it is
    /// queued already.
    fn claim(&self) -> Option<&'a QueueNode> {
        let entry: &'a Cpu = &self.cpus.cpus[self.cpu];
        if entry.queued.swap(true, Relaxed) {
            return None;
        }
        Some(&entry.node)
    }

    /// Marks the core's node as no longer queued.
    fn unclaim(&self) {
        self.cpus.cpus[self.cpu].queued.store(false, Relaxed);
    }
}

impl Drop for CpuGuard<'_> {
    fn drop(&mut self) {
        self.cpus.cpus[self.cpu].occupied.store(false, Release);
    }
}

impl Debug for CpuGuard<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuGuard").field("cpu", &self.cpu).finish()
    }
}

/// Proof that a [`PerCpuLock`] was acquired through the borrowed
/// [`CpuGuard`].
#[must_use = "dropping the token without unlocking leaves the lock held"]
pub struct CpuToken<'g, 'a> {
    pin: &'g CpuGuard<'a>,
    node: &'a QueueNode,
}

impl<'g, 'a> CpuToken<'g, 'a> {
    /// Returns the core the lock was acquired on.
    #[must_use]
    pub fn cpu(&self) -> usize {
        self.pin.cpu
    }
}

impl Debug for CpuToken<'_, '_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuToken").field("cpu", &self.cpu()).finish()
    }
}

/// An MCS lock that queues the node of the caller's pinned core.
pub struct PerCpuLock<R> {
    queue: McsQueue<R>,
}

impl<R> PerCpuLock<R> {
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

    /// Returns `true` if some core holds the lock.
    pub fn is_locked(&self) -> bool {
        self.queue.is_locked()
    }
}

impl<R: Relax> PerCpuLock<R> {
    /// Acquires this lock with the node of the core `pin` occupies.
    ///
    /// # Panics
    ///
    /// Panics if that node is already queued on another `PerCpuLock`.
    #[track_caller]
    pub fn lock<'g, 'a>(&self, pin: &'g CpuGuard<'a>) -> CpuToken<'g, 'a> {
        match self.checked_lock(pin) {
            Some(token) => token,
            None => panic!(node_in_use_error!()),
        }
    }

    /// Acquires this lock with the node of the core `pin` occupies, or
    /// returns `None` without queueing if that node is already in use.
    pub fn checked_lock<'g, 'a>(&self, pin: &'g CpuGuard<'a>) -> Option<CpuToken<'g, 'a>> {
        let node = pin.claim()?;
        // SAFETY: The node was just claimed, so it is not queued anywhere, and
        // it stays claimed until `unlock`. The `Cpus` table owning it is
        // leaked instead of dropped while it is claimed, so the node outlives
        // this lock's queue even if the token is never given back.
        unsafe { self.queue.lock(node) };
        Some(CpuToken { pin, node })
    }

    /// Releases this lock, handing it to the next queued core.
    ///
    /// # Safety
    ///
    /// `token` must have been returned by acquiring this same lock.
    pub unsafe fn unlock(&self, token: CpuToken<'_, '_>) {
        // SAFETY: Caller guaranteed the node is queued on this lock.
        unsafe { self.queue.unlock(token.node) };
        token.pin.unclaim();
    }
}

impl<R> Default for PerCpuLock<R> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Debug for PerCpuLock<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerCpuLock").field("locked", &self.is_locked()).finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::Cpus;
    use crate::relax::Yield;

    type PerCpuLock = super::PerCpuLock<Yield>;

    #[test]
    fn pin_excludes_other_tasks_from_the_core() {
        let cpus = Cpus::new(2);
        assert_eq!(cpus.len(), 2);
        assert!(!cpus.is_empty());
        let pin = cpus.pin(0);
        assert!(cpus.is_pinned(0));
        assert!(cpus.try_pin(0).is_none());
        assert!(cpus.try_pin(1).is_some());
        drop(pin);
        assert!(!cpus.is_pinned(0));
        assert!(cpus.try_pin(0).is_some());
    }

    #[test]
    #[should_panic]
    fn pin_out_of_range_panics() {
        let cpus = Cpus::new(1);
        let _pin = cpus.pin(1);
    }

    #[test]
    fn guard_knows_its_table() {
        let (cpus, other) = (Cpus::new(1), Cpus::new(1));
        let pin = cpus.pin(0);
        assert!(pin.belongs_to(&cpus));
        assert!(!pin.belongs_to(&other));
        assert_eq!(pin.cpu(), 0);
    }

    #[test]
    #[should_panic = "per-cpu MCS node is already queued on another lock"]
    fn nested_acquisition_on_one_core_panics() {
        let cpus = Cpus::new(1);
        let (outer, inner) = (PerCpuLock::new(), PerCpuLock::new());
        let pin = cpus.pin(0);
        let _token = outer.lock(&pin);
        let _ = inner.lock(&pin);
    }

    #[test]
    fn checked_lock_reports_node_in_use() {
        let cpus = Cpus::new(1);
        let (outer, inner) = (PerCpuLock::new(), PerCpuLock::new());
        let pin = cpus.pin(0);
        let token = outer.lock(&pin);
        assert!(pin.node_in_use());
        assert!(inner.checked_lock(&pin).is_none());
        unsafe { outer.unlock(token) };
        assert!(!pin.node_in_use());
        let token = inner.lock(&pin);
        unsafe { inner.unlock(token) };
    }

    #[test]
    fn dropped_token_keeps_the_node_claimed_across_pins() {
        let cpus = Cpus::new(1);
        let (first, second) = (PerCpuLock::new(), PerCpuLock::new());
        {
            let pin = cpus.pin(0);
            drop(first.lock(&pin));
        }
        assert!(!cpus.is_pinned(0));
        assert!(cpus.is_queued(0));
        let pin = cpus.pin(0);
        assert!(pin.node_in_use());
        assert!(first.checked_lock(&pin).is_none());
        assert!(second.checked_lock(&pin).is_none());
        assert!(first.is_locked());
        assert!(!second.is_locked());
        // The core is still usable for anything but queueing its node.
        drop(pin);
        assert!(cpus.try_pin(0).is_some());
    }

    #[test]
    fn table_with_a_queued_node_is_leaked_on_drop() {
        let lock = PerCpuLock::new();
        {
            let cpus = Cpus::new(1);
            let pin = cpus.pin(0);
            drop(lock.lock(&pin));
        }
        // The tail still points into the dropped table, which must be alive.
        assert!(lock.is_locked());
        let tail = lock.queue.tail();
        assert!(unsafe { &*tail }.next.load(Ordering::Relaxed).is_null());
    }

    #[test]
    fn released_node_is_free_for_the_next_pin() {
        let cpus = Cpus::new(1);
        let lock = PerCpuLock::new();
        {
            let pin = cpus.pin(0);
            let token = lock.lock(&pin);
            unsafe { lock.unlock(token) };
        }
        assert!(!cpus.is_queued(0));
        let pin = cpus.pin(0);
        assert!(!pin.node_in_use());
        let token = lock.lock(&pin);
        unsafe { lock.unlock(token) };
    }

    #[test]
    fn lots_and_lots_pinned_round_robin() {
        const CORES: usize = 3;
        const THREADS: usize = 6;
        const ITERS: usize = 1000;
        let cpus = Arc::new(Cpus::new(CORES));
        let lock = Arc::new(PerCpuLock::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..THREADS)
            .map(|worker| {
                let (cpus, lock) = (Arc::clone(&cpus), Arc::clone(&lock));
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..ITERS {
                        let pin = cpus.pin_with::<Yield>(worker % CORES);
                        let token = lock.lock(&pin);
                        let value = counter.load(Ordering::Relaxed);
                        counter.store(value + 1, Ordering::Relaxed);
                        unsafe { lock.unlock(token) };
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
}

#[cfg(all(loom, test))]
mod model {
    use core::sync::atomic::Ordering::Relaxed;

    use loom::sync::atomic::AtomicUsize;
    use loom::sync::Arc;
    use loom::{model, thread};

    use super::Cpus;
    use crate::relax::Yield;

    type PerCpuLock = super::PerCpuLock<Yield>;

    #[test]
    fn two_cores_lock_join() {
        model(|| {
            const CORES: usize = 2;
            let cpus = Arc::new(Cpus::new(CORES));
            let lock = Arc::new(PerCpuLock::new());
            let count = Arc::new(AtomicUsize::new(0));
            let handles: Vec<_> = (0..CORES)
                .map(|cpu| {
                    let (cpus, lock) = (Arc::clone(&cpus), Arc::clone(&lock));
                    let count = Arc::clone(&count);
                    thread::spawn(move || {
                        let pin = cpus.pin_with::<Yield>(cpu);
                        let token = lock.lock(&pin);
                        let value = count.load(Relaxed);
                        count.store(value + 1, Relaxed);
                        unsafe { lock.unlock(token) };
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            assert_eq!(count.load(Relaxed), CORES);
        });
    }
}
