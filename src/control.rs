//! A control plane that drives a single in-flight lock through four requests.
//!
//! This is the request protocol a device style front end exposes: one lock at
//! a time is created, acquired and released by any number of workers, then
//! destroyed before another can be created. The transport that carries the
//! requests is left to the caller; [`ControlPlane::handle`] dispatches one
//! decoded [`Request`].
//!
//! | Request | Success | Errors |
//! |---|---|---|
//! | [`CreateLock`] | `Ok` | [`AlreadyExists`], [`OutOfMemory`], [`CapacityExceeded`] |
//! | [`Acquire`] | `Ok` once granted | [`NotFound`] |
//! | [`Release`] | `Ok` | [`NotFound`] |
//! | [`DestroyLock`] | `Ok` | [`NotFound`] |
//!
//! The strategy specific errors of [`LockRegistry`] pass through unchanged.
//!
//! [`CreateLock`]: Request::CreateLock
//! [`Acquire`]: Request::Acquire
//! [`Release`]: Request::Release
//! [`DestroyLock`]: Request::DestroyLock
//! [`AlreadyExists`]: LockError::AlreadyExists
//! [`OutOfMemory`]: LockError::OutOfMemory
//! [`CapacityExceeded`]: LockError::CapacityExceeded
//! [`NotFound`]: LockError::NotFound

use core::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use log::{debug, warn};

use crate::mcs::per_cpu::Cpus;
use crate::registry::{Cookie, LockError, LockId, LockRegistry, LockType};
use crate::relax::{Relax, Spin};

/// A decoded control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Create the in-flight lock with the given algorithm.
    CreateLock(LockType),
    /// Acquire the in-flight lock.
    Acquire,
    /// Release the in-flight lock.
    Release,
    /// Destroy the in-flight lock.
    DestroyLock,
}

/// The single in-flight lock of a control plane, over a [`LockRegistry`].
///
/// # Example
///
/// ```
/// use cflock::control::{ControlPlane, Request};
/// use cflock::registry::{Cookie, LockType};
///
/// # fn main() -> Result<(), cflock::registry::LockError> {
/// let mut plane = ControlPlane::<cflock::relax::Spin>::with_cpus(4);
/// let mut cookie = Cookie::new();
///
/// plane.handle(Request::CreateLock(LockType::McsTransient), &mut cookie)?;
/// plane.handle(Request::Acquire, &mut cookie)?;
/// plane.handle(Request::Release, &mut cookie)?;
/// plane.handle(Request::DestroyLock, &mut cookie)?;
/// # Ok(())
/// # }
/// ```
pub struct ControlPlane<R = Spin> {
    registry: LockRegistry<R>,
    current: Option<LockId>,
}

impl<R> ControlPlane<R> {
    /// Creates a control plane with no lock, whose per-CPU locks run on
    /// `cpus`.
    #[must_use]
    pub fn new(cpus: Arc<Cpus>) -> Self {
        Self { registry: LockRegistry::new(cpus), current: None }
    }

    /// Creates a control plane with no lock and `count` logical cores of its
    /// own.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero.
    #[must_use]
    pub fn with_cpus(count: usize) -> Self {
        Self::new(Arc::new(Cpus::new(count)))
    }

    /// Returns the logical cores to pin to before acquiring a per-CPU lock.
    #[must_use]
    pub fn cpus(&self) -> &Arc<Cpus> {
        self.registry.cpus()
    }

    /// Returns the type of the in-flight lock, if there is one.
    #[must_use]
    pub fn lock_type(&self) -> Option<LockType> {
        self.current.and_then(|id| self.registry.lock_type(id).ok())
    }

    /// Creates the in-flight lock.
    pub fn create(&mut self, kind: LockType) -> Result<(), LockError> {
        if let Some(current) = self.current {
            warn!("cannot create {kind}: {current} is in flight");
            return Err(LockError::AlreadyExists);
        }
        self.current = Some(self.registry.create(kind)?);
        Ok(())
    }

    /// Destroys the in-flight lock and returns its type.
    pub fn destroy(&mut self) -> Result<LockType, LockError> {
        let id = self.current.ok_or(LockError::NotFound)?;
        let kind = self.registry.destroy(id)?;
        self.current = None;
        Ok(kind)
    }

    fn current(&self) -> Result<LockId, LockError> {
        self.current.ok_or_else(|| {
            warn!("no lock in flight");
            LockError::NotFound
        })
    }
}

impl<R: Relax> ControlPlane<R> {
    /// Acquires the in-flight lock through `cookie`.
    pub fn acquire(&self, cookie: &mut Cookie<'_>) -> Result<(), LockError> {
        self.registry.acquire(self.current()?, cookie)
    }

    /// Releases the in-flight lock held through `cookie`.
    pub fn release(&self, cookie: &mut Cookie<'_>) -> Result<(), LockError> {
        self.registry.release(self.current()?, cookie)
    }

    /// Dispatches one request. `cookie` is only used by [`Request::Acquire`]
    /// and [`Request::Release`].
    pub fn handle(&mut self, request: Request, cookie: &mut Cookie<'_>) -> Result<(), LockError> {
        debug!("control request {request:?}");
        match request {
            Request::CreateLock(kind) => self.create(kind),
            Request::Acquire => self.acquire(cookie),
            Request::Release => self.release(cookie),
            Request::DestroyLock => self.destroy().map(drop),
        }
    }
}

impl<R> Debug for ControlPlane<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlPlane")
            .field("current", &self.current)
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use strum::IntoEnumIterator;

    use super::{ControlPlane, Request};
    use crate::registry::{Cookie, LockError, LockType};
    use crate::relax::Yield;

    type Plane = ControlPlane<Yield>;

    #[test]
    fn requests_without_a_lock_are_not_found() {
        let mut plane = Plane::with_cpus(1);
        let mut cookie = Cookie::new();
        assert_eq!(plane.handle(Request::Acquire, &mut cookie), Err(LockError::NotFound));
        assert_eq!(plane.handle(Request::Release, &mut cookie), Err(LockError::NotFound));
        assert_eq!(plane.handle(Request::DestroyLock, &mut cookie), Err(LockError::NotFound));
        assert_eq!(plane.lock_type(), None);
    }

    #[test]
    fn second_create_already_exists() {
        let mut plane = Plane::with_cpus(1);
        let mut cookie = Cookie::new();
        plane.handle(Request::CreateLock(LockType::Spin), &mut cookie).unwrap();
        let err = plane.handle(Request::CreateLock(LockType::Array), &mut cookie);
        assert_eq!(err, Err(LockError::AlreadyExists));
        assert_eq!(plane.lock_type(), Some(LockType::Spin));
        assert_eq!(plane.destroy(), Ok(LockType::Spin));
        plane.create(LockType::Array).unwrap();
        assert_eq!(plane.lock_type(), Some(LockType::Array));
    }

    #[test]
    fn destroyed_lock_is_not_found() {
        let mut plane = Plane::with_cpus(1);
        let mut cookie = Cookie::new();
        plane.create(LockType::McsTransient).unwrap();
        plane.handle(Request::DestroyLock, &mut cookie).unwrap();
        assert_eq!(plane.acquire(&mut cookie), Err(LockError::NotFound));
        assert_eq!(plane.destroy(), Err(LockError::NotFound));
    }

    #[test]
    fn held_lock_stays_in_flight() {
        let mut plane = Plane::with_cpus(1);
        let mut cookie = Cookie::new();
        plane.create(LockType::Spin).unwrap();
        plane.acquire(&mut cookie).unwrap();
        assert_eq!(plane.destroy(), Err(LockError::Busy));
        plane.release(&mut cookie).unwrap();
        assert_eq!(plane.destroy(), Ok(LockType::Spin));
    }

    #[test]
    fn full_cycle_for_every_type() {
        const WORKERS: usize = 3;
        const ITERS: usize = 200;
        let mut plane = Plane::with_cpus(WORKERS);
        let cpus = plane.cpus().clone();
        for kind in LockType::iter() {
            plane.handle(Request::CreateLock(kind), &mut Cookie::new()).unwrap();
            let counter = AtomicUsize::new(0);
            thread::scope(|scope| {
                for cpu in 0..WORKERS {
                    let (plane, cpus, counter) = (&plane, &cpus, &counter);
                    scope.spawn(move || {
                        for _ in 0..ITERS {
                            let pin = cpus.pin_with::<Yield>(cpu);
                            let mut cookie = Cookie::pinned(&pin);
                            plane.acquire(&mut cookie).unwrap();
                            let value = counter.load(Ordering::Relaxed);
                            counter.store(value + 1, Ordering::Relaxed);
                            plane.release(&mut cookie).unwrap();
                        }
                    });
                }
            });
            assert_eq!(counter.into_inner(), WORKERS * ITERS, "{kind}");
            plane.handle(Request::DestroyLock, &mut Cookie::new()).unwrap();
        }
    }
}
