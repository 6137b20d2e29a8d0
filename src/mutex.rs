use core::fmt::{self, Debug, Display, Formatter};
use core::mem::ManuallyDrop;

use crate::cfg::cell::{UnsafeCell, UnsafeCellWith};
use crate::lock::RawLock;

/// A mutual exclusion primitive useful for protecting shared data, generic
/// over the locking algorithm `L`.
///
/// The data can only be accessed through the RAII guards returned by
/// [`lock`], or given as the closure argument of [`lock_with`], which
/// guarantees that it is only ever accessed while `L` is held.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use cflock::mcs::transient::TransientLock;
/// use cflock::mutex::Mutex;
/// use cflock::relax::Spin;
///
/// type McsMutex<T> = Mutex<T, TransientLock<Spin>>;
///
/// let data = Arc::new(McsMutex::new(0));
/// let handles: Vec<_> = (0..4)
///     .map(|_| {
///         let data = Arc::clone(&data);
///         thread::spawn(move || *data.lock() += 1)
///     })
///     .collect();
/// for handle in handles {
///     handle.join().expect("thread::spawn failed");
/// }
/// assert_eq!(*data.lock(), 4);
/// ```
/// [`lock`]: Mutex::lock
/// [`lock_with`]: Mutex::lock_with
pub struct Mutex<T: ?Sized, L> {
    lock: L,
    data: UnsafeCell<T>,
}

// Same unsafe impls as `std::sync::Mutex`.
unsafe impl<T: ?Sized + Send, L: Send> Send for Mutex<T, L> {}
unsafe impl<T: ?Sized + Send, L: Sync> Sync for Mutex<T, L> {}

impl<T, L: RawLock> Mutex<T, L> {
    /// Creates a new mutex in an unlocked state ready for use.
    pub fn new(value: T) -> Self {
        Self { lock: L::new(), data: UnsafeCell::new(value) }
    }
}

impl<T: ?Sized, L: RawLock> Mutex<T, L> {
    /// Acquires this mutex, busy-waiting until it is able to do so.
    ///
    /// The mutex is released when the returned guard goes out of scope.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T, L> {
        let token = self.lock.lock();
        MutexGuard { mutex: self, token: ManuallyDrop::new(token) }
    }

    /// Acquires this mutex and then runs the closure against its guard.
    ///
    /// Borrows of the guard or its data cannot escape the closure:
    ///
    /// ```compile_fail,E0515
    /// use cflock::mutex::Mutex;
    /// use cflock::relax::Spin;
    /// use cflock::spin::SpinLock;
    ///
    /// let mutex = Mutex::<_, SpinLock<Spin>>::new(1);
    /// let data = mutex.lock_with(|guard| &*guard);
    /// ```
    #[inline]
    pub fn lock_with<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(MutexGuard<'_, T, L>) -> Ret,
    {
        f(self.lock())
    }
}

impl<T: ?Sized, L> Mutex<T, L> {
    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this call borrows the `Mutex` mutably, no actual locking needs to
    /// take place.
    #[cfg(not(all(loom, test)))]
    #[inline(always)]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T, L> Mutex<T, L> {
    /// Consumes this mutex, returning the underlying data.
    #[cfg(not(all(loom, test)))]
    #[inline]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default, L: RawLock> Default for Mutex<T, L> {
    /// Creates a `Mutex<T, L>`, with the `Default` value for `T`.
    #[inline]
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl<T, L: RawLock> From<T> for Mutex<T, L> {
    /// Creates a `Mutex<T, L>` from a instance of `T`.
    #[inline]
    fn from(data: T) -> Self {
        Self::new(data)
    }
}

impl<T: ?Sized + Debug, L: RawLock> Debug for Mutex<T, L> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Mutex");
        self.lock().with(|data| d.field("data", &data));
        d.finish()
    }
}

/// An RAII implementation of a "scoped lock" of a mutex. When this structure
/// is dropped (falls out of scope), the lock will be released.
///
/// The guard is `!Send` whenever the lock token is, which keeps thread bound
/// algorithms such as [`PerThreadLock`] from being released elsewhere.
///
/// [`PerThreadLock`]: crate::mcs::thread_local::PerThreadLock
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a, T: ?Sized, L: RawLock> {
    mutex: &'a Mutex<T, L>,
    token: ManuallyDrop<L::Token>,
}

// Same unsafe Sync impl as `std::sync::MutexGuard`.
unsafe impl<T: ?Sized + Sync, L: RawLock + Sync> Sync for MutexGuard<'_, T, L> {}

impl<T: ?Sized, L: RawLock> MutexGuard<'_, T, L> {
    /// Runs `f` against a shared reference pointing to the underlying data.
    pub(crate) fn with<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(&T) -> Ret,
    {
        // SAFETY: A guard instance holds the lock locked.
        unsafe { self.mutex.data.with_unchecked(f) }
    }

    /// Runs `f` against an exclusive reference pointing to the underlying data.
    #[cfg(test)]
    pub(crate) fn with_mut<F, Ret>(&mut self, f: F) -> Ret
    where
        F: FnOnce(&mut T) -> Ret,
    {
        // SAFETY: A guard instance holds the lock locked, and `&mut self`
        // excludes every other access through this guard.
        unsafe { self.mutex.data.with_mut_unchecked(f) }
    }
}

impl<T: ?Sized, L: RawLock> Drop for MutexGuard<'_, T, L> {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: The token is taken exactly once, here.
        let token = unsafe { ManuallyDrop::take(&mut self.token) };
        // SAFETY: The token was returned by locking this same mutex, and the
        // guard is only `Send` if the token is.
        unsafe { self.mutex.lock.unlock(token) }
    }
}

impl<T: ?Sized + Debug, L: RawLock> Debug for MutexGuard<'_, T, L> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|data| data.fmt(f))
    }
}

impl<T: ?Sized + Display, L: RawLock> Display for MutexGuard<'_, T, L> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|data| data.fmt(f))
    }
}

#[cfg(not(all(loom, test)))]
impl<T: ?Sized, L: RawLock> core::ops::Deref for MutexGuard<'_, T, L> {
    type Target = T;

    /// Dereferences the guard to access the underlying data.
    #[inline(always)]
    fn deref(&self) -> &T {
        // SAFETY: A guard instance holds the lock locked.
        unsafe { &*self.mutex.data.get() }
    }
}

#[cfg(not(all(loom, test)))]
impl<T: ?Sized, L: RawLock> core::ops::DerefMut for MutexGuard<'_, T, L> {
    /// Mutably dereferences the guard to access the underlying data.
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: A guard instance holds the lock locked.
        unsafe { &mut *self.mutex.data.get() }
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use crate::relax::Yield;
    use crate::spin::SpinLock;
    use crate::test::tests::NonCopy;

    type Mutex<T> = super::Mutex<T, SpinLock<Yield>>;

    #[test]
    fn test_mutex_default() {
        let mut mutex: Mutex<u32> = Default::default();
        assert_eq!(u32::default(), *mutex.get_mut());
    }

    #[test]
    fn test_mutex_from() {
        let value = 42;
        let mut mutex = Mutex::from(value);
        assert_eq!(value, *mutex.get_mut());
    }

    #[test]
    fn test_get_mut() {
        let mut mutex = Mutex::new(NonCopy(10));
        *mutex.get_mut() = NonCopy(20);
        assert_eq!(*mutex.get_mut(), NonCopy(20));
    }

    #[test]
    fn test_into_inner() {
        let mutex = Mutex::new(NonCopy(10));
        assert_eq!(mutex.into_inner(), NonCopy(10));
    }

    #[test]
    fn test_guard_debug_display() {
        let value = 42;
        let mutex = Mutex::new(value);
        mutex.lock_with(|data| {
            assert_eq!(format!("{value:?}"), format!("{data:?}"));
            assert_eq!(format!("{value}"), format!("{data}"));
        });
    }
}
