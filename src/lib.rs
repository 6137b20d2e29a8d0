//! Interchangeable busy-waiting mutual exclusion algorithms behind a single
//! lifecycle contract, and a concurrency harness that validates and times
//! them.
//!
//! The algorithms, from the simplest to the most cache friendly:
//!
//! - [`spin::SpinLock`]: one shared flag, test-and-test-and-set, no fairness;
//! - [`array::ArrayLock`]: a ring of cache-padded flags indexed by a ticket
//!   counter, FIFO, each waiter spinning on its own line;
//! - [`mcs::McsQueue`]: the Mellor-Crummey and Scott queue lock, FIFO, each
//!   waiter spinning on its own queue node, with three node storage
//!   strategies: [`mcs::thread_local::PerThreadLock`],
//!   [`mcs::per_cpu::PerCpuLock`] and [`mcs::transient::TransientLock`].
//!
//! Every algorithm is generic over a [`relax::Relax`] policy that decides how
//! a waiter burns its time, and the ones that are safe to acquire without any
//! context from the caller implement [`lock::RawLock`], which
//! [`mutex::Mutex`] wraps into a data protecting mutex with an RAII guard.
//!
//! ## Spinlock use cases
//!
//! It is noteworthy to mention that [spinlocks are usually not what you want].
//! The majority of use cases are well covered by OS-based mutexes like
//! [`std::sync::Mutex`]. Busy-waiting only pays off when critical sections are
//! very short and waiters cannot be descheduled while holding or queued,
//! which is why the per-CPU lock and the harness model pinned cores through
//! [`mcs::per_cpu::Cpus`].
//!
//! ## Registry and control plane
//!
//! [`registry::LockRegistry`] creates, acquires, releases and destroys locks
//! of any [`registry::LockType`] by id, dispatching to the selected
//! algorithm. [`control::ControlPlane`] layers the single in-flight lock
//! request protocol on top of it.
//!
//! ```
//! use cflock::registry::{Cookie, LockRegistry, LockType};
//!
//! # fn main() -> Result<(), cflock::registry::LockError> {
//! let mut registry = LockRegistry::<cflock::relax::Spin>::with_cpus(4);
//! let id = registry.create(LockType::McsPerCpu)?;
//!
//! let cpus = registry.cpus().clone();
//! let pin = cpus.pin(0);
//! let mut cookie = Cookie::pinned(&pin);
//! registry.acquire(id, &mut cookie)?;
//! registry.release(id, &mut cookie)?;
//! drop(pin);
//!
//! registry.destroy(id)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Harness
//!
//! [`harness::run`] drives many workers through each lock type, checks that
//! a shared counter incremented under the lock loses nothing, and reports
//! the elapsed and average time of every trial. The `bench` feature builds
//! the `cflock-bench` command line front end for it.
//!
//! ## Logging
//!
//! Lifecycle transitions and harness progress are emitted through the [`log`]
//! facade; install any logger to see them.
//!
//! [spinlocks are usually not what you want]: https://matklad.github.io/2020/01/02/spinlocks-considered-harmful.html
//! [`log`]: https://docs.rs/log

#![allow(clippy::doc_markdown)]
#![allow(clippy::inline_always)]
#![allow(clippy::module_name_repetitions)]
#![warn(missing_docs)]
#![warn(rust_2024_compatibility)]
#![warn(clippy::undocumented_unsafe_blocks)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod array;
pub mod control;
pub mod harness;
pub mod lock;
pub mod mcs;
pub mod mutex;
pub mod registry;
pub mod relax;
pub mod spin;

pub(crate) mod cfg;

#[cfg(test)]
pub(crate) mod test;

#[cfg(all(loom, test))]
#[cfg(not(tarpaulin))]
pub(crate) mod loom;
