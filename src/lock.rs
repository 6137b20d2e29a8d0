//! The acquire/release contract shared by the locking algorithms.

/// A raw mutual exclusion algorithm that can be acquired without any extra
/// context from the caller.
///
/// Acquiring returns a [`Token`] that carries whatever per-acquisition state
/// the algorithm needs back at release time, such as the thread local node
/// of a [`PerThreadLock`]. Tokens of algorithms that resolve their queue node
/// through the calling thread are `!Send`, so they must be released on the
/// thread that acquired them.
///
/// [`PerCpuLock`] does not implement this trait: acquiring it requires a
/// [`CpuGuard`] pin. Neither does [`ArrayLock`], whose acquisition is only
/// sound with a bounded number of concurrent waiters.
///
/// # Safety
///
/// Implementors must guarantee that, once `lock` (or a successful `try_lock`)
/// returns a token, no other acquisition of the same instance returns until
/// that token is passed to `unlock`.
///
/// [`Token`]: RawLock::Token
/// [`ArrayLock`]: crate::array::ArrayLock
/// [`PerThreadLock`]: crate::mcs::thread_local::PerThreadLock
/// [`PerCpuLock`]: crate::mcs::per_cpu::PerCpuLock
/// [`CpuGuard`]: crate::mcs::per_cpu::CpuGuard
pub unsafe trait RawLock {
    /// Per-acquisition state handed back to [`unlock`](RawLock::unlock).
    type Token;

    /// Creates a new lock in an unlocked state.
    fn new() -> Self
    where
        Self: Sized;

    /// Acquires this lock, busy-waiting until it is granted.
    fn lock(&self) -> Self::Token;

    /// Releases this lock, handing it to the next waiter if there is one.
    ///
    /// # Safety
    ///
    /// `token` must have been returned by an acquisition of this same
    /// instance, on the current thread if the token is `!Send`.
    unsafe fn unlock(&self, token: Self::Token);
}
