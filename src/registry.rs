//! An arena of independent lock instances behind one lifecycle contract.
//!
//! Every lock created through a [`LockRegistry`] is addressed by a
//! [`LockId`] and driven through the same four operations, whatever algorithm
//! backs it:
//!
//! | Operation | Receiver | Errors |
//! |---|---|---|
//! | [`create`] | `&mut self` | [`OutOfMemory`], [`CapacityExceeded`] |
//! | [`acquire`] | `&self` | [`NotFound`], [`NotPinned`], [`NodeInUse`] |
//! | [`release`] | `&self` | [`NotFound`], [`NotHeld`] |
//! | [`destroy`] | `&mut self` | [`NotFound`], [`Busy`] |
//!
//! Lifecycle transitions borrow the registry exclusively, so they can never
//! race with workers acquiring and releasing through shared borrows.
//!
//! The per-acquisition state an algorithm needs back at release time travels
//! in a caller owned [`Cookie`], which also carries the [`CpuGuard`] pin the
//! per-CPU MCS lock and the array lock require. Only one task runs on a
//! pinned core, so the number of cores bounds the waiters of an array lock.
//!
//! [`create`]: LockRegistry::create
//! [`acquire`]: LockRegistry::acquire
//! [`release`]: LockRegistry::release
//! [`destroy`]: LockRegistry::destroy
//! [`OutOfMemory`]: LockError::OutOfMemory
//! [`CapacityExceeded`]: LockError::CapacityExceeded
//! [`NotFound`]: LockError::NotFound
//! [`NotPinned`]: LockError::NotPinned
//! [`NodeInUse`]: LockError::NodeInUse
//! [`NotHeld`]: LockError::NotHeld
//! [`Busy`]: LockError::Busy

use core::fmt::{self, Debug, Display, Formatter};
use core::marker::PhantomData;
use std::sync::Arc;

use log::{debug, warn};
use strum::{Display, EnumIter, EnumMessage, EnumString, IntoStaticStr};

use crate::array::{ArrayLock, Slot, ARRAY_SLOTS};
use crate::mcs::per_cpu::{CpuGuard, CpuToken, Cpus, PerCpuLock};
use crate::mcs::thread_local::{PerThreadLock, ThreadToken};
use crate::mcs::transient::TransientLock;
use crate::relax::{Relax, Spin};
use crate::spin::SpinLock;

/// The locking algorithm backing a registry entry.
///
/// `Display` gives the name used in benchmark reports, and `FromStr` accepts
/// either that name or the short identifier (`spin`, `array`,
/// `mcs-per-thread`, `mcs-transient`, `mcs-per-cpu`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, EnumMessage, IntoStaticStr)]
#[strum(ascii_case_insensitive)]
pub enum LockType {
    /// [`SpinLock`](crate::spin::SpinLock).
    #[strum(serialize = "spin", to_string = "spin lock")]
    Spin,
    /// [`ArrayLock`](crate::array::ArrayLock) with [`ARRAY_SLOTS`] slots.
    #[strum(serialize = "array", to_string = "array lock")]
    Array,
    /// [`PerThreadLock`](crate::mcs::thread_local::PerThreadLock).
    #[strum(serialize = "mcs-per-thread", to_string = "per thread mcs lock")]
    McsPerThread,
    /// [`TransientLock`](crate::mcs::transient::TransientLock).
    #[strum(serialize = "mcs-transient", to_string = "transient mcs lock")]
    McsTransient,
    /// [`PerCpuLock`](crate::mcs::per_cpu::PerCpuLock).
    #[strum(serialize = "mcs-per-cpu", to_string = "per cpu mcs lock")]
    McsPerCpu,
}

impl LockType {
    /// Returns the short identifier this type parses from.
    #[must_use]
    pub fn ident(self) -> &'static str {
        // `serialize` comes before `to_string` in the serializations.
        self.get_serializations().first().copied().unwrap_or_default()
    }

    /// Returns `true` if acquiring this type requires a pinned [`Cookie`].
    #[must_use]
    pub const fn needs_pin(self) -> bool {
        matches!(self, Self::Array | Self::McsPerCpu)
    }
}

/// Errors returned by the registry and the control plane.
///
/// None of them is transient: retrying the same request fails the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// A lock is already in flight (control plane only).
    AlreadyExists,
    /// The id is unknown, or its lock was destroyed.
    NotFound,
    /// The backing state could not be allocated.
    OutOfMemory,
    /// An array lock was created in a registry with more cores than the
    /// lock has slots.
    CapacityExceeded,
    /// A per-CPU or array lock was acquired through a cookie with no pin, or
    /// with a pin from another registry's cores.
    NotPinned,
    /// The queue node this acquisition needs is already queued on another
    /// lock, or the cookie already holds a lock.
    NodeInUse,
    /// The cookie does not hold the lock it is releasing.
    NotHeld,
    /// The lock is still held and cannot be destroyed.
    Busy,
}

impl Display for LockError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::AlreadyExists => "a lock already exists",
            Self::NotFound => "lock not found",
            Self::OutOfMemory => "out of memory",
            Self::CapacityExceeded => "more cores than array lock slots",
            Self::NotPinned => "lock acquired without a pinned core",
            Self::NodeInUse => "queue node already in use",
            Self::NotHeld => "lock is not held by this cookie",
            Self::Busy => "lock is still held",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for LockError {}

/// A registry entry address: arena index plus the generation of the slot.
///
/// Ids of destroyed locks never match a lock created later in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockId {
    index: u32,
    generation: u32,
}

impl Display for LockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Per-acquisition state, by algorithm.
enum Held<'p> {
    Spin,
    Array(Slot),
    PerThread(ThreadToken),
    Transient,
    PerCpu(CpuToken<'p, 'p>),
}

/// Per-acquisition token that a caller passes to [`acquire`] and then to the
/// matching [`release`].
///
/// A cookie holds at most one lock at a time. It is `!Send`, so a lock is
/// always released on the thread that acquired it. A cookie created with
/// [`Cookie::pinned`] carries a [`CpuGuard`] and can acquire per-CPU locks.
///
/// [`acquire`]: LockRegistry::acquire
/// [`release`]: LockRegistry::release
pub struct Cookie<'p> {
    pin: Option<&'p CpuGuard<'p>>,
    held: Option<(LockId, Held<'p>)>,
    thread: PhantomData<*const ()>,
}

impl<'p> Cookie<'p> {
    /// Creates a cookie with no pin.
    #[must_use]
    pub const fn new() -> Self {
        Self { pin: None, held: None, thread: PhantomData }
    }

    /// Creates a cookie bound to the core `pin` occupies.
    #[must_use]
    pub const fn pinned(pin: &'p CpuGuard<'p>) -> Self {
        Self { pin: Some(pin), held: None, thread: PhantomData }
    }

    /// Returns the pin this cookie carries, if any.
    #[must_use]
    pub fn pin(&self) -> Option<&'p CpuGuard<'p>> {
        self.pin
    }

    /// Returns the id of the lock this cookie holds, if any.
    #[must_use]
    pub fn held(&self) -> Option<LockId> {
        self.held.as_ref().map(|(id, _)| *id)
    }
}

impl Default for Cookie<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Cookie<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cookie")
            .field("cpu", &self.pin.map(CpuGuard::cpu))
            .field("held", &self.held())
            .finish()
    }
}

/// The backing state of one lock, stored inline in the arena.
#[allow(clippy::large_enum_variant)]
enum Backing<R> {
    Spin(SpinLock<R>),
    Array(ArrayLock<ARRAY_SLOTS, R>),
    PerThread(PerThreadLock<R>),
    Transient(TransientLock<R>),
    PerCpu(PerCpuLock<R>),
}

impl<R> Backing<R> {
    fn new(kind: LockType) -> Self {
        match kind {
            LockType::Spin => Self::Spin(SpinLock::new()),
            LockType::Array => Self::Array(ArrayLock::new()),
            LockType::McsPerThread => Self::PerThread(PerThreadLock::new()),
            LockType::McsTransient => Self::Transient(TransientLock::new()),
            LockType::McsPerCpu => Self::PerCpu(PerCpuLock::new()),
        }
    }

    /// Whether the lock is held. Only exact while nobody is acquiring it.
    fn is_locked(&self) -> bool {
        match self {
            Self::Spin(lock) => lock.is_locked(),
            Self::Array(lock) => lock.is_locked(),
            Self::PerThread(lock) => lock.is_locked(),
            Self::Transient(lock) => lock.is_locked(),
            Self::PerCpu(lock) => lock.is_locked(),
        }
    }
}

struct LockHandle<R> {
    kind: LockType,
    backing: Backing<R>,
}

struct Entry<R> {
    generation: u32,
    handle: Option<LockHandle<R>>,
}

/// An arena of lock instances of any [`LockType`], relaxing with `R` while
/// contended.
///
/// # Example
///
/// ```
/// use cflock::registry::{Cookie, LockRegistry, LockType};
///
/// # fn main() -> Result<(), cflock::registry::LockError> {
/// let mut registry = LockRegistry::<cflock::relax::Spin>::with_cpus(2);
/// let id = registry.create(LockType::Array)?;
///
/// let cpus = registry.cpus().clone();
/// let pin = cpus.pin(1);
/// let mut cookie = Cookie::pinned(&pin);
/// registry.acquire(id, &mut cookie)?;
/// registry.release(id, &mut cookie)?;
/// drop(pin);
///
/// assert_eq!(registry.destroy(id)?, LockType::Array);
/// # Ok(())
/// # }
/// ```
pub struct LockRegistry<R = Spin> {
    entries: Vec<Entry<R>>,
    free: Vec<u32>,
    len: usize,
    cpus: Arc<Cpus>,
}

impl<R> LockRegistry<R> {
    /// Creates an empty registry whose per-CPU locks run on `cpus`.
    #[must_use]
    pub fn new(cpus: Arc<Cpus>) -> Self {
        Self { entries: Vec::new(), free: Vec::new(), len: 0, cpus }
    }

    /// Creates an empty registry with `count` logical cores of its own.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero.
    #[must_use]
    pub fn with_cpus(count: usize) -> Self {
        Self::new(Arc::new(Cpus::new(count)))
    }

    /// Returns the logical cores workers pin to before acquiring a per-CPU
    /// lock of this registry.
    #[must_use]
    pub fn cpus(&self) -> &Arc<Cpus> {
        &self.cpus
    }

    /// Returns the number of live locks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if no lock is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the type of lock `id`.
    pub fn lock_type(&self, id: LockId) -> Result<LockType, LockError> {
        self.handle(id).map(|handle| handle.kind)
    }

    /// Creates a lock of type `kind` in an unlocked state.
    ///
    /// An array lock can only be created if this registry has no more cores
    /// than [`ARRAY_SLOTS`].
    pub fn create(&mut self, kind: LockType) -> Result<LockId, LockError> {
        if kind == LockType::Array && self.cpus.len() > ARRAY_SLOTS {
            warn!("cannot create {kind}: {}", LockError::CapacityExceeded);
            return Err(LockError::CapacityExceeded);
        }
        let index = match self.free.pop() {
            Some(index) => index,
            None => self.grow().map_err(|err| {
                warn!("cannot create {kind}: {err}");
                err
            })?,
        };
        let entry = &mut self.entries[index as usize];
        entry.handle = Some(LockHandle { kind, backing: Backing::new(kind) });
        self.len += 1;
        let id = LockId { index, generation: entry.generation };
        debug!("created {kind} {id}");
        Ok(id)
    }

    /// Appends an empty entry, reserving room for its index in the free list
    /// so that `destroy` never allocates. The entry has room for any backing
    /// state, so `create` allocates nothing else.
    fn grow(&mut self) -> Result<u32, LockError> {
        let index = u32::try_from(self.entries.len()).map_err(|_| LockError::OutOfMemory)?;
        self.entries.try_reserve(1).map_err(|_| LockError::OutOfMemory)?;
        self.free.try_reserve(self.entries.len() + 1).map_err(|_| LockError::OutOfMemory)?;
        self.entries.push(Entry { generation: 0, handle: None });
        Ok(index)
    }

    /// Destroys lock `id` and returns its type. The id is never valid again.
    ///
    /// Fails with [`LockError::Busy`] if some cookie still holds the lock.
    pub fn destroy(&mut self, id: LockId) -> Result<LockType, LockError> {
        let entry = self.entry_mut(id).ok_or(LockError::NotFound).map_err(|err| {
            warn!("cannot destroy {id}: {err}");
            err
        })?;
        if entry.handle.as_ref().is_some_and(|handle| handle.backing.is_locked()) {
            warn!("cannot destroy {id}: {}", LockError::Busy);
            return Err(LockError::Busy);
        }
        let handle = entry.handle.take().ok_or(LockError::NotFound)?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        debug!("destroyed {} {id}", handle.kind);
        Ok(handle.kind)
    }

    fn entry_mut(&mut self, id: LockId) -> Option<&mut Entry<R>> {
        self.entries
            .get_mut(id.index as usize)
            .filter(|entry| entry.generation == id.generation && entry.handle.is_some())
    }

    fn handle(&self, id: LockId) -> Result<&LockHandle<R>, LockError> {
        self.entries
            .get(id.index as usize)
            .filter(|entry| entry.generation == id.generation)
            .and_then(|entry| entry.handle.as_ref())
            .ok_or(LockError::NotFound)
    }
}

impl<R: Relax> LockRegistry<R> {
    /// Acquires lock `id`, busy-waiting until it is granted, and records the
    /// acquisition in `cookie`.
    pub fn acquire<'p>(&self, id: LockId, cookie: &mut Cookie<'p>) -> Result<(), LockError> {
        let result = self.acquire_inner(id, cookie);
        if let Err(err) = result {
            warn!("cannot acquire {id}: {err}");
        }
        result
    }

    fn acquire_inner<'p>(&self, id: LockId, cookie: &mut Cookie<'p>) -> Result<(), LockError> {
        let handle = self.handle(id)?;
        if cookie.held.is_some() {
            return Err(LockError::NodeInUse);
        }
        let held = match &handle.backing {
            Backing::Spin(lock) => {
                lock.lock();
                Held::Spin
            }
            Backing::Array(lock) => {
                let _pin = self.pin(cookie)?;
                // SAFETY: Every thread inside `lock` occupies a distinct core
                // of `self.cpus`, and `create` checked that there are no more
                // of them than slots.
                Held::Array(unsafe { lock.lock() })
            }
            Backing::PerThread(lock) => Held::PerThread(lock.checked_lock().ok_or(LockError::NodeInUse)?),
            Backing::Transient(lock) => {
                lock.lock();
                Held::Transient
            }
            Backing::PerCpu(lock) => {
                let pin = self.pin(cookie)?;
                Held::PerCpu(lock.checked_lock(pin).ok_or(LockError::NodeInUse)?)
            }
        };
        cookie.held = Some((id, held));
        Ok(())
    }

    /// Returns the pin of `cookie` if it occupies a core of this registry.
    fn pin<'p>(&self, cookie: &Cookie<'p>) -> Result<&'p CpuGuard<'p>, LockError> {
        cookie.pin.filter(|pin| pin.belongs_to(&self.cpus)).ok_or(LockError::NotPinned)
    }

    /// Releases lock `id` held through `cookie`, handing it to the next
    /// waiter if there is one.
    pub fn release(&self, id: LockId, cookie: &mut Cookie<'_>) -> Result<(), LockError> {
        let result = self.release_inner(id, cookie);
        if let Err(err) = result {
            warn!("cannot release {id}: {err}");
        }
        result
    }

    fn release_inner(&self, id: LockId, cookie: &mut Cookie<'_>) -> Result<(), LockError> {
        let handle = self.handle(id)?;
        let held = match cookie.held.take() {
            Some((held_id, held)) if held_id == id => held,
            other => {
                cookie.held = other;
                return Err(LockError::NotHeld);
            }
        };
        // SAFETY: `held` was recorded by acquiring this very lock: ids are
        // never reused, a held lock cannot be destroyed, and the cookie is
        // `!Send`, so this is also the acquiring thread.
        unsafe {
            match (&handle.backing, held) {
                (Backing::Spin(lock), Held::Spin) => lock.unlock(),
                (Backing::Array(lock), Held::Array(slot)) => lock.unlock(slot),
                (Backing::PerThread(lock), Held::PerThread(token)) => lock.unlock(token),
                (Backing::Transient(lock), Held::Transient) => lock.unlock(),
                (Backing::PerCpu(lock), Held::PerCpu(token)) => lock.unlock(token),
                _ => unreachable!("the type of a lock never changes"),
            }
        }
        Ok(())
    }
}

impl<R> Debug for LockRegistry<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockRegistry").field("len", &self.len).field("cpus", &self.cpus).finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use core::mem;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use strum::{EnumMessage, IntoEnumIterator};

    use super::{Backing, Cookie, LockError, LockType, ARRAY_SLOTS};
    use crate::array::ArrayLock;
    use crate::mcs::per_cpu::Cpus;
    use crate::relax::Yield;

    type LockRegistry = super::LockRegistry<Yield>;

    #[test]
    fn lock_type_names_and_idents() {
        let names: Vec<String> = LockType::iter().map(|kind| kind.to_string()).collect();
        assert_eq!(
            names,
            ["spin lock", "array lock", "per thread mcs lock", "transient mcs lock", "per cpu mcs lock"]
        );
        let idents: Vec<&str> = LockType::iter().map(LockType::ident).collect();
        assert_eq!(idents, ["spin", "array", "mcs-per-thread", "mcs-transient", "mcs-per-cpu"]);
        for kind in LockType::iter() {
            // Exactly the identifier and the name parse back.
            let name: &'static str = kind.into();
            assert_eq!(kind.get_serializations(), [kind.ident(), name]);
            assert_eq!(kind.ident().parse::<LockType>(), Ok(kind));
            assert_eq!(kind.to_string().parse::<LockType>(), Ok(kind));
            assert_eq!(kind.ident().to_uppercase().parse::<LockType>(), Ok(kind));
        }
        assert!("ticket".parse::<LockType>().is_err());
    }

    #[test]
    fn lifecycle_of_every_type() {
        let mut registry = LockRegistry::with_cpus(1);
        for kind in LockType::iter() {
            let id = registry.create(kind).unwrap();
            assert_eq!(registry.lock_type(id), Ok(kind));
            {
                let pin = registry.cpus().pin(0);
                let mut cookie = Cookie::pinned(&pin);
                registry.acquire(id, &mut cookie).unwrap();
                assert_eq!(cookie.held(), Some(id));
                registry.release(id, &mut cookie).unwrap();
                assert_eq!(cookie.held(), None);
            }
            assert_eq!(registry.destroy(id), Ok(kind));
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn stale_ids_are_not_found() {
        let mut registry = LockRegistry::with_cpus(1);
        let old = registry.create(LockType::Spin).unwrap();
        registry.destroy(old).unwrap();
        let new = registry.create(LockType::Spin).unwrap();
        assert_ne!(old, new);
        let mut cookie = Cookie::new();
        assert_eq!(registry.acquire(old, &mut cookie), Err(LockError::NotFound));
        assert_eq!(registry.release(old, &mut cookie), Err(LockError::NotFound));
        assert_eq!(registry.destroy(old), Err(LockError::NotFound));
        assert_eq!(registry.lock_type(old), Err(LockError::NotFound));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn locks_are_independent() {
        let mut registry = LockRegistry::with_cpus(2);
        let first = registry.create(LockType::Array).unwrap();
        let second = registry.create(LockType::Array).unwrap();
        let cpus = registry.cpus().clone();
        let (pin_a, pin_b) = (cpus.pin(0), cpus.pin(1));
        let (mut a, mut b) = (Cookie::pinned(&pin_a), Cookie::pinned(&pin_b));
        registry.acquire(first, &mut a).unwrap();
        registry.acquire(second, &mut b).unwrap();
        registry.release(second, &mut b).unwrap();
        registry.release(first, &mut a).unwrap();
    }

    #[test]
    fn pinned_types_require_a_pin_of_this_registry() {
        let mut registry = LockRegistry::with_cpus(1);
        for kind in [LockType::Array, LockType::McsPerCpu] {
            assert!(kind.needs_pin());
            let id = registry.create(kind).unwrap();
            let mut cookie = Cookie::new();
            assert_eq!(registry.acquire(id, &mut cookie), Err(LockError::NotPinned));
            let foreign = Cpus::new(1);
            let pin = foreign.pin(0);
            let mut cookie = Cookie::pinned(&pin);
            assert_eq!(registry.acquire(id, &mut cookie), Err(LockError::NotPinned));
            assert_eq!(cookie.held(), None);
            assert!(!registry.handle(id).unwrap().backing.is_locked());
        }
    }

    #[test]
    fn array_needs_a_slot_per_core() {
        let mut registry = LockRegistry::with_cpus(ARRAY_SLOTS + 1);
        assert_eq!(registry.create(LockType::Array), Err(LockError::CapacityExceeded));
        assert!(registry.is_empty());
        registry.create(LockType::McsPerCpu).unwrap();
        let mut registry = LockRegistry::with_cpus(ARRAY_SLOTS);
        registry.create(LockType::Array).unwrap();
    }

    #[test]
    fn array_state_lives_in_the_arena() {
        // No separate allocation can fail after the arena has grown.
        assert!(mem::size_of::<Backing<Yield>>() >= mem::size_of::<ArrayLock<ARRAY_SLOTS, Yield>>());
    }

    #[test]
    fn dropped_cookie_keeps_the_per_cpu_node_in_use() {
        let mut registry = LockRegistry::with_cpus(1);
        let first = registry.create(LockType::McsPerCpu).unwrap();
        let second = registry.create(LockType::McsPerCpu).unwrap();
        let cpus = registry.cpus().clone();
        {
            let pin = cpus.pin(0);
            let mut cookie = Cookie::pinned(&pin);
            registry.acquire(first, &mut cookie).unwrap();
        }
        let pin = cpus.pin(0);
        let mut cookie = Cookie::pinned(&pin);
        assert_eq!(registry.acquire(first, &mut cookie), Err(LockError::NodeInUse));
        assert_eq!(registry.acquire(second, &mut cookie), Err(LockError::NodeInUse));
        assert_eq!(registry.destroy(first), Err(LockError::Busy));
        assert_eq!(registry.destroy(second), Ok(LockType::McsPerCpu));
    }

    #[test]
    fn node_in_use_is_reported() {
        let mut registry = LockRegistry::with_cpus(1);
        let outer = registry.create(LockType::McsPerThread).unwrap();
        let inner = registry.create(LockType::McsPerThread).unwrap();
        let (mut a, mut b) = (Cookie::new(), Cookie::new());
        registry.acquire(outer, &mut a).unwrap();
        assert_eq!(registry.acquire(inner, &mut b), Err(LockError::NodeInUse));
        // A cookie holds one lock at a time.
        assert_eq!(registry.acquire(inner, &mut a), Err(LockError::NodeInUse));
        registry.release(outer, &mut a).unwrap();
        registry.acquire(inner, &mut b).unwrap();
        registry.release(inner, &mut b).unwrap();
    }

    #[test]
    fn release_requires_the_holding_cookie() {
        let mut registry = LockRegistry::with_cpus(1);
        let first = registry.create(LockType::Spin).unwrap();
        let second = registry.create(LockType::Spin).unwrap();
        let mut cookie = Cookie::new();
        assert_eq!(registry.release(first, &mut cookie), Err(LockError::NotHeld));
        registry.acquire(first, &mut cookie).unwrap();
        assert_eq!(registry.release(second, &mut cookie), Err(LockError::NotHeld));
        assert_eq!(cookie.held(), Some(first));
        registry.release(first, &mut cookie).unwrap();
    }

    #[test]
    fn held_lock_cannot_be_destroyed() {
        let mut registry = LockRegistry::with_cpus(1);
        let id = registry.create(LockType::Array).unwrap();
        let cpus = registry.cpus().clone();
        let pin = cpus.pin(0);
        let mut cookie = Cookie::pinned(&pin);
        registry.acquire(id, &mut cookie).unwrap();
        assert_eq!(registry.destroy(id), Err(LockError::Busy));
        registry.release(id, &mut cookie).unwrap();
        assert_eq!(registry.destroy(id), Ok(LockType::Array));
    }

    #[test]
    fn shared_registry_serializes_workers() {
        const WORKERS: usize = 4;
        const ITERS: usize = 500;
        let mut registry = LockRegistry::with_cpus(WORKERS);
        for kind in LockType::iter() {
            let id = registry.create(kind).unwrap();
            let counter = AtomicUsize::new(0);
            thread::scope(|scope| {
                for cpu in 0..WORKERS {
                    let (registry, counter) = (&registry, &counter);
                    scope.spawn(move || {
                        for _ in 0..ITERS {
                            let pin = registry.cpus().pin_with::<Yield>(cpu);
                            let mut cookie = Cookie::pinned(&pin);
                            registry.acquire(id, &mut cookie).unwrap();
                            let value = counter.load(Ordering::Relaxed);
                            counter.store(value + 1, Ordering::Relaxed);
                            registry.release(id, &mut cookie).unwrap();
                        }
                    });
                }
            });
            assert_eq!(counter.into_inner(), WORKERS * ITERS, "{kind}");
            registry.destroy(id).unwrap();
        }
    }
}
