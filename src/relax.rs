// Exponential backoff and the relax strategies are modified versions of the
// spin-rs `relax.rs` and the crossbeam-utils `backoff.rs` implementations.
//
// Copyright (c) 2014 Mathijs van de Nes
// Copyright (c) 2019 The Crossbeam Project Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Strategies that determine how a lock busy-waits while it is contended.
//!
//! Every lock in this crate is generic over a [`Relax`] policy. The policy is
//! instantiated once per wait loop and its [`relax`] method is called on every
//! failed check of the awaited condition.
//!
//! [`relax`]: Relax::relax

use crate::cfg::{hint, thread};

/// A trait implemented by spinning relax strategies.
///
/// # Example
///
/// ```
/// use cflock::relax::Relax;
///
/// struct Pause;
///
/// impl Relax for Pause {
///     #[inline(always)]
///     fn new() -> Self {
///         Self
///     }
///
///     #[inline(always)]
///     fn relax(&mut self) {
///         core::hint::spin_loop();
///     }
/// }
/// ```
pub trait Relax {
    /// Returns the initial value for this relaxing strategy.
    fn new() -> Self;

    /// Performs the relaxing operation during a period of contention.
    fn relax(&mut self);
}

/// Spins until `done` returns `true`, relaxing with `R` between checks.
#[inline]
pub(crate) fn wait_until<R: Relax>(mut done: impl FnMut() -> bool) {
    let mut relax = R::new();
    while !done() {
        relax.relax();
    }
}

/// A strategy that rapidly spins while issuing the processor backoff hint
/// through [`core::hint::spin_loop`] (`pause` on x86, `yield`/`isb` on Arm).
///
/// This is the behaviour of the `rep; nop` loops the locks in this crate were
/// designed around, and the default policy of the registry and harness.
pub struct Spin;

impl Relax for Spin {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {
        hint::spin_loop();
    }
}

/// A strategy that yields the current time slice to the OS scheduler on every
/// failed check.
///
/// Useful when there are more runnable waiters than cores, where a pure spin
/// burns the holder's time slice.
pub struct Yield;

impl Relax for Yield {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {
        thread::yield_now();
    }
}

/// A strategy that rapidly spins, without telling the CPU to do any powering
/// down.
///
/// Exists as a baseline for benchmarks and for targets that miscompile spin
/// hint intrinsics. Prefer [`Spin`].
pub struct Loop;

impl Relax for Loop {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {}
}

/// An unsigned integer type use as the inner type for [`Backoff`].
type Uint = u32;

/// A strategy that, as [`Spin`], runs a busy-wait loop, except it doubles the
/// number of spin hints issued on every call, up to `1 << 6`.
pub struct SpinBackoff {
    inner: Backoff<{ Self::MAX }>,
}

impl SpinBackoff {
    /// The largest value the inner backoff counter can reach.
    const MAX: Uint = 6;
}

// The bitshift in `Backoff::end` overflows past `Uint::BITS`.
const _: () = assert!(SpinBackoff::MAX < Uint::BITS);

impl Relax for SpinBackoff {
    #[inline(always)]
    fn new() -> Self {
        Self { inner: Backoff::default() }
    }

    #[inline(always)]
    fn relax(&mut self) {
        self.inner.saturating_spin();
        self.inner.saturating_step();
    }
}

/// A strategy that performs exponential backoff like [`SpinBackoff`] until the
/// counter saturates, then yields to the OS scheduler like [`Yield`].
pub struct YieldBackoff {
    inner: Backoff<{ Self::MAX }>,
}

impl YieldBackoff {
    /// The largest value the inner backoff counter can reach.
    const MAX: Uint = SpinBackoff::MAX;
}

const _: () = assert!(YieldBackoff::MAX < Uint::BITS);

impl Relax for YieldBackoff {
    #[inline(always)]
    fn new() -> Self {
        Self { inner: Backoff::default() }
    }

    #[inline(always)]
    fn relax(&mut self) {
        if self.inner.0 < Self::MAX {
            self.inner.saturating_spin();
        } else {
            thread::yield_now();
        }
        self.inner.saturating_step();
    }
}

/// Inner backoff counter that keeps track of the number of shifts applied.
#[derive(Default)]
struct Backoff<const MAX: Uint>(Uint);

impl<const MAX: Uint> Backoff<MAX> {
    /// The number of iterations that the backoff spin loop will execute.
    const fn end(shifts: Uint) -> Uint {
        1 << shifts
    }

    /// Runs a bounded spin loop `1 << self.0` times, `self.0` capped at `MAX`.
    fn saturating_spin(&self) {
        let shifts = self.0.min(MAX);
        for _ in 0..Self::end(shifts) {
            hint::spin_loop();
        }
    }

    /// Increments the inner counter, saturating at `MAX`.
    fn saturating_step(&mut self) {
        (self.0 < MAX).then(|| self.0 += 1);
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::{Relax, Uint};

    fn returns<R: Relax, const MAX: Uint>() {
        let mut relax = R::new();
        for _ in 0..=MAX.saturating_mul(10) {
            relax.relax();
        }
    }

    #[test]
    fn spins() {
        returns::<super::Spin, 10>();
    }

    #[test]
    fn spins_backoff() {
        use super::SpinBackoff;
        const MAX: Uint = SpinBackoff::MAX;
        returns::<SpinBackoff, MAX>();
    }

    #[test]
    fn yields() {
        returns::<super::Yield, 10>();
    }

    #[test]
    fn yields_backoff() {
        use super::YieldBackoff;
        const MAX: Uint = YieldBackoff::MAX;
        returns::<YieldBackoff, MAX>();
    }

    #[test]
    fn loops() {
        returns::<super::Loop, 10>();
    }

    #[test]
    fn wait_until_stops_once_done() {
        let mut checks = 0;
        super::wait_until::<super::Spin>(|| {
            checks += 1;
            checks == 5
        });
        assert_eq!(checks, 5);
    }
}
