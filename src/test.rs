use crate::lock::RawLock;
use crate::mutex::Mutex;

/// An arbitrary unsigned integer type.
pub type Int = u32;

/// Get a copy of the mutex protected data.
pub fn get<T: Copy, L: RawLock>(mutex: &Mutex<T, L>) -> T {
    mutex.lock_with(|guard| guard.with(|data| *data))
}

/// Increments a shared integer.
pub fn inc<L: RawLock>(mutex: &Mutex<Int, L>) {
    mutex.lock_with(|mut guard| guard.with_mut(|data| *data += 1));
}

#[cfg(all(not(loom), test))]
pub mod tests {
    // Modified test suite from the Rust's Mutex implementation with minor changes
    // since the API is not compatible with this crate implementation and some
    // new tests as well.
    //
    // Copyright 2014 The Rust Project Developers.
    //
    // Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
    // http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
    // <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
    // option. This file may not be copied, modified, or distributed
    // except according to those terms.

    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::thread;

    use super::{get, inc, Int};
    use crate::lock::RawLock;
    use crate::mutex::Mutex;

    #[derive(Eq, PartialEq, Debug)]
    pub struct NonCopy(pub u32);

    const ITERS: Int = 1000;
    const CONCURRENCY: Int = 3;
    const EXPECTED_VALUE: Int = ITERS * CONCURRENCY * 2;

    fn inc_for<L: RawLock>(mutex: &Mutex<Int, L>) {
        for _ in 0..ITERS {
            inc(mutex);
        }
    }

    pub fn lots_and_lots_lock<L>()
    where
        L: RawLock + Send + Sync + 'static,
    {
        let mutex = Arc::new(Mutex::<Int, L>::new(0));
        let (tx, rx) = channel();
        for _ in 0..2 * CONCURRENCY {
            let c_mutex = Arc::clone(&mutex);
            let tx2 = tx.clone();
            thread::spawn(move || {
                inc_for(&c_mutex);
                tx2.send(()).unwrap();
            });
        }
        drop(tx);
        for _ in 0..2 * CONCURRENCY {
            rx.recv().unwrap();
        }
        assert_eq!(get(&mutex), EXPECTED_VALUE);
    }

    pub fn smoke<L: RawLock>() {
        let mutex = Mutex::<Int, L>::new(1);
        drop(mutex.lock());
        drop(mutex.lock());
        assert_eq!(get(&mutex), 1);
    }

    pub fn test_mutex_debug<L: RawLock>() {
        let value: Int = 42;
        let mutex = Mutex::<Int, L>::new(value);
        let msg = format!("Mutex {{ data: {value:?} }}");
        assert_eq!(msg, format!("{mutex:?}"));
    }

    pub fn test_lock_arc_nested<L1, L2>()
    where
        L1: RawLock + Send + Sync + 'static,
        L2: RawLock + Send + Sync + 'static,
    {
        // Tests nested locks and access
        // to underlying data.
        let arc = Arc::new(Mutex::<Int, L1>::new(1));
        let arc2 = Arc::new(Mutex::<_, L2>::new(arc));
        let (tx, rx) = channel();
        let _t = thread::spawn(move || {
            let val = arc2.lock_with(|guard| guard.with(|inner| get(inner)));
            assert_eq!(val, 1);
            tx.send(()).unwrap();
        });
        rx.recv().unwrap();
    }

    pub fn test_acquire_more_than_one_lock<L>()
    where
        L: RawLock + Send + Sync + 'static,
    {
        let arc = Arc::new(Mutex::<Int, L>::new(1));
        let (tx, rx) = channel();
        for _ in 0..4 {
            let tx2 = tx.clone();
            let c_arc = Arc::clone(&arc);
            let _t = thread::spawn(move || {
                c_arc.lock_with(|_d| {
                    let mutex = Mutex::<Int, L>::new(1);
                    mutex.lock_with(|_g| ());
                });
                tx2.send(()).unwrap();
            });
        }
        drop(tx);
        for _ in 0..4 {
            rx.recv().unwrap();
        }
    }

    pub fn test_lock_arc_access_in_unwind<L>()
    where
        L: RawLock + Send + Sync + 'static,
    {
        let arc = Arc::new(Mutex::<Int, L>::new(1));
        let arc2 = arc.clone();
        let _ = thread::spawn(move || {
            struct Unwinder<L: RawLock> {
                i: Arc<Mutex<Int, L>>,
            }
            impl<L: RawLock> Drop for Unwinder<L> {
                fn drop(&mut self) {
                    inc(&self.i);
                }
            }
            let _u = Unwinder { i: arc2 };
            panic!();
        })
        .join();
        let value = get(&arc);
        assert_eq!(value, 2);
    }
}
