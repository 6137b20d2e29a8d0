pub mod models {
    use core::array;

    use loom::sync::Arc;
    use loom::{model, thread};

    use crate::lock::RawLock;
    use crate::mutex::Mutex;
    use crate::test::{get, inc, Int};

    const LOCKS: usize = 2;

    /// Evaluates that concurrent `lock` calls will serialize all mutations
    /// against the shared data, therefore no data races.
    pub fn lock_join<L: RawLock + Send + Sync + 'static>() {
        model(|| {
            const RUNS: usize = LOCKS;
            let data = Arc::new(Mutex::<Int, L>::new(0));
            let handles: [_; RUNS] = array::from_fn(|_| {
                let data = Arc::clone(&data);
                thread::spawn(move || inc(&data))
            });
            for handle in handles {
                handle.join().unwrap();
            }
            let data = get(&*data);
            assert_eq!(RUNS as Int, data);
        });
    }
}
