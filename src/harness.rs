//! A benchmark that drives many workers through every lock type and checks
//! that no increment of a shared counter is lost.
//!
//! Each run creates one lock in a [`LockRegistry`], spawns `workers` threads
//! spread round-robin over the logical cores of a [`Cpus`] table, and has
//! every worker repeat `iterations` times: pin its core, acquire, increment
//! the counter with a separate load and store, release, unpin. The counter is
//! not atomic as far as the increment is concerned, so any failure of mutual
//! exclusion shows up as a final value below `workers * iterations`.
//!
//! Runs are repeated for `trials` rounds over the selected lock types, and a
//! [`TrialReport`] with the elapsed and running average time is produced for
//! every run.
//!
//! ```no_run
//! use cflock::harness::{self, Config};
//!
//! # fn main() -> Result<(), cflock::harness::HarnessError> {
//! let config = Config::default().with_trials(2);
//! harness::run(&config, |report| println!("{report}"))?;
//! # Ok(())
//! # }
//! ```

use core::fmt::{self, Display, Formatter};
use core::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::panic;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info};
use strum::{Display as StrumDisplay, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

use crate::array::ARRAY_SLOTS;
use crate::mcs::per_cpu::Cpus;
use crate::registry::{Cookie, LockError, LockId, LockRegistry, LockType};
use crate::relax::{Loop, Relax, Spin, SpinBackoff, Yield, YieldBackoff};

/// The relax policy every lock and pin of a run busy-waits with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, StrumDisplay, EnumString, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum RelaxKind {
    /// [`Spin`].
    #[default]
    Spin,
    /// [`SpinBackoff`].
    SpinBackoff,
    /// [`Yield`].
    Yield,
    /// [`YieldBackoff`].
    YieldBackoff,
    /// [`Loop`].
    Loop,
}

/// The parameters of a benchmark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Number of concurrent workers per run.
    pub workers: usize,
    /// Acquire, increment, release cycles per worker.
    pub iterations: usize,
    /// Number of logical cores workers are spread over.
    pub cpus: usize,
    /// How long every worker sleeps before the timed section starts.
    pub warmup: Duration,
    /// Number of rounds over the lock types.
    pub trials: usize,
    /// The busy-wait policy.
    pub relax: RelaxKind,
    /// The lock types to run, in order.
    pub locks: Vec<LockType>,
}

impl Config {
    /// 100 workers.
    pub const DEFAULT_WORKERS: usize = 100;
    /// 500 cycles per worker.
    pub const DEFAULT_ITERATIONS: usize = 500;
    /// 4 logical cores.
    pub const DEFAULT_CPUS: usize = 4;
    /// 1 second of warm-up.
    pub const DEFAULT_WARMUP: Duration = Duration::from_secs(1);
    /// 10 rounds.
    pub const DEFAULT_TRIALS: usize = 10;

    /// Sets the number of workers.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the cycles per worker.
    #[must_use]
    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    /// Sets the number of logical cores.
    #[must_use]
    pub fn with_cpus(mut self, cpus: usize) -> Self {
        self.cpus = cpus;
        self
    }

    /// Sets the warm-up delay.
    #[must_use]
    pub fn with_warmup(mut self, warmup: Duration) -> Self {
        self.warmup = warmup;
        self
    }

    /// Sets the number of rounds.
    #[must_use]
    pub fn with_trials(mut self, trials: usize) -> Self {
        self.trials = trials;
        self
    }

    /// Sets the busy-wait policy.
    #[must_use]
    pub fn with_relax(mut self, relax: RelaxKind) -> Self {
        self.relax = relax;
        self
    }

    /// Sets the lock types to run.
    #[must_use]
    pub fn with_locks(mut self, locks: impl IntoIterator<Item = LockType>) -> Self {
        self.locks = locks.into_iter().collect();
        self
    }

    /// The counter value every run must end with.
    #[must_use]
    pub fn expected_count(&self) -> u64 {
        (self.workers as u64).saturating_mul(self.iterations as u64)
    }

    /// Checks that every count is non-zero and that no more workers than
    /// [`ARRAY_SLOTS`] can contend at once.
    pub fn validate(&self) -> Result<(), HarnessError> {
        let reason = if self.workers == 0 {
            "workers must be at least 1"
        } else if self.iterations == 0 {
            "iterations must be at least 1"
        } else if self.trials == 0 {
            "trials must be at least 1"
        } else if self.cpus == 0 {
            "cpus must be at least 1"
        } else if self.cpus > ARRAY_SLOTS {
            "cpus must not exceed the array lock slots"
        } else if self.locks.is_empty() {
            "at least one lock type is required"
        } else {
            return Ok(());
        };
        Err(HarnessError::InvalidConfig(reason))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: Self::DEFAULT_WORKERS,
            iterations: Self::DEFAULT_ITERATIONS,
            cpus: Self::DEFAULT_CPUS,
            warmup: Self::DEFAULT_WARMUP,
            trials: Self::DEFAULT_TRIALS,
            relax: RelaxKind::default(),
            locks: LockType::iter().collect(),
        }
    }
}

/// Errors that abort a benchmark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HarnessError {
    /// The configuration was rejected by [`Config::validate`].
    InvalidConfig(&'static str),
    /// A registry operation failed.
    Lock {
        /// The lock type being run.
        lock: LockType,
        /// The registry error.
        source: LockError,
    },
    /// Increments were lost: mutual exclusion was violated.
    CounterMismatch {
        /// The lock type being run.
        lock: LockType,
        /// The round the run belongs to.
        trial: usize,
        /// `workers * iterations`.
        expected: u64,
        /// The final counter value.
        actual: u64,
    },
}

impl Display for HarnessError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(reason) => write!(f, "invalid configuration: {reason}"),
            Self::Lock { lock, .. } => write!(f, "{lock} failed"),
            Self::CounterMismatch { lock, trial, expected, actual } => {
                write!(f, "{lock} trial {trial}: counter is {actual} instead of {expected}")
            }
        }
    }
}

impl std::error::Error for HarnessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Lock { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// The outcome of one run of one lock type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrialReport {
    /// The round, starting at 0.
    pub trial: usize,
    /// The lock type.
    pub lock: LockType,
    /// Wall clock time of the timed section.
    pub elapsed: Duration,
    /// Running average of `elapsed` over this and the earlier rounds, in
    /// whole milliseconds.
    pub average_ms: u64,
}

impl TrialReport {
    /// Returns `elapsed` in whole milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX)
    }
}

impl Display for TrialReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}) {}  curr time[ms]={}  avg[ms]={}",
            self.trial,
            self.lock,
            self.elapsed_ms(),
            self.average_ms
        )
    }
}

/// Folds the `trial`-th sample into the running average of the earlier ones.
fn running_average(trial: usize, average: u64, sample: u64) -> u64 {
    let k = trial as u64;
    k.saturating_mul(average).saturating_add(sample) / (k + 1)
}

/// A counter incremented with a separate load and store, so that a lock that
/// lets two workers in at once loses increments.
#[derive(Debug, Default)]
struct SharedCounter(AtomicU64);

impl SharedCounter {
    fn increment(&self) {
        let value = self.0.load(Relaxed);
        self.0.store(value + 1, Relaxed);
    }

    fn into_inner(self) -> u64 {
        self.0.into_inner()
    }
}

/// Runs the benchmark described by `config`, calling `on_report` as soon as
/// every run completes, and returns all the reports.
///
/// Rounds are the outer loop and lock types the inner one.
pub fn run<F>(config: &Config, on_report: F) -> Result<Vec<TrialReport>, HarnessError>
where
    F: FnMut(&TrialReport),
{
    config.validate()?;
    match config.relax {
        RelaxKind::Spin => run_with::<Spin, F>(config, on_report),
        RelaxKind::SpinBackoff => run_with::<SpinBackoff, F>(config, on_report),
        RelaxKind::Yield => run_with::<Yield, F>(config, on_report),
        RelaxKind::YieldBackoff => run_with::<YieldBackoff, F>(config, on_report),
        RelaxKind::Loop => run_with::<Loop, F>(config, on_report),
    }
}

fn run_with<R, F>(config: &Config, mut on_report: F) -> Result<Vec<TrialReport>, HarnessError>
where
    R: Relax,
    F: FnMut(&TrialReport),
{
    let cpus = Arc::new(Cpus::new(config.cpus));
    let mut registry = LockRegistry::<R>::new(Arc::clone(&cpus));
    let mut averages = vec![0; config.locks.len()];
    let mut reports = Vec::with_capacity(config.trials * config.locks.len());
    for trial in 0..config.trials {
        info!("trial {trial}: {} workers x {} iterations", config.workers, config.iterations);
        for (&lock, average) in config.locks.iter().zip(&mut averages) {
            let elapsed = run_once(config, &mut registry, lock, trial)?;
            let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
            *average = running_average(trial, *average, elapsed_ms);
            let report = TrialReport { trial, lock, elapsed, average_ms: *average };
            on_report(&report);
            reports.push(report);
        }
    }
    Ok(reports)
}

/// Creates a lock of type `lock`, drives every worker through it, destroys it
/// and checks the counter.
fn run_once<R: Relax>(
    config: &Config,
    registry: &mut LockRegistry<R>,
    lock: LockType,
    trial: usize,
) -> Result<Duration, HarnessError> {
    let lock_err = |source| HarnessError::Lock { lock, source };
    let id = registry.create(lock).map_err(lock_err)?;
    debug!("running {lock} {id}");
    let counter = SharedCounter::default();
    let elapsed = drive(config, registry, id, &counter);
    registry.destroy(id).map_err(lock_err)?;
    let elapsed = elapsed.map_err(lock_err)?;

    let (expected, actual) = (config.expected_count(), counter.into_inner());
    if actual != expected {
        error!("{lock} lost {} increments", expected - actual.min(expected));
        return Err(HarnessError::CounterMismatch { lock, trial, expected, actual });
    }
    debug!("{lock} {id} done in {elapsed:?}");
    Ok(elapsed)
}

/// Spawns the workers and times them from the moment they all leave the
/// warm-up until the last one finishes.
fn drive<R: Relax>(
    config: &Config,
    registry: &LockRegistry<R>,
    id: LockId,
    counter: &SharedCounter,
) -> Result<Duration, LockError> {
    let start = Barrier::new(config.workers + 1);
    thread::scope(|scope| {
        let handles: Vec<_> = (0..config.workers)
            .map(|worker| {
                let cpu = worker % config.cpus;
                let start = &start;
                scope.spawn(move || {
                    thread::sleep(config.warmup);
                    start.wait();
                    work::<R>(registry, id, cpu, config.iterations, counter)
                })
            })
            .collect();
        start.wait();
        let clock = Instant::now();
        let mut result = Ok(());
        for handle in handles {
            match handle.join() {
                Ok(outcome) => result = result.and(outcome),
                Err(payload) => panic::resume_unwind(payload),
            }
        }
        result.map(|()| clock.elapsed())
    })
}

/// One worker: `iterations` pinned acquire, increment, release cycles.
fn work<R: Relax>(
    registry: &LockRegistry<R>,
    id: LockId,
    cpu: usize,
    iterations: usize,
    counter: &SharedCounter,
) -> Result<(), LockError> {
    let cpus = registry.cpus();
    for _ in 0..iterations {
        let pin = cpus.pin_with::<R>(cpu);
        let mut cookie = Cookie::pinned(&pin);
        registry.acquire(id, &mut cookie)?;
        counter.increment();
        registry.release(id, &mut cookie)?;
    }
    Ok(())
}

#[cfg(all(not(loom), test))]
mod test {
    use std::error::Error;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use strum::IntoEnumIterator;

    use super::{run, running_average, Config, HarnessError, RelaxKind, TrialReport};
    use crate::array::ARRAY_SLOTS;
    use crate::registry::{LockError, LockType};

    fn small() -> Config {
        Config::default()
            .with_workers(4)
            .with_iterations(500)
            .with_warmup(Duration::ZERO)
            .with_relax(RelaxKind::Yield)
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.workers, 100);
        assert_eq!(config.iterations, 500);
        assert_eq!(config.cpus, 4);
        assert_eq!(config.warmup, Duration::from_secs(1));
        assert_eq!(config.trials, 10);
        assert_eq!(config.locks, LockType::iter().collect::<Vec<_>>());
        assert_eq!(config.expected_count(), 50_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let invalid = [
            small().with_workers(0),
            small().with_iterations(0),
            small().with_trials(0),
            small().with_cpus(0),
            small().with_cpus(ARRAY_SLOTS + 1),
            Config { locks: Vec::new(), ..small() },
        ];
        for config in invalid {
            assert!(matches!(config.validate(), Err(HarnessError::InvalidConfig(_))));
            assert!(matches!(run(&config, |_| ()), Err(HarnessError::InvalidConfig(_))));
        }
        assert!(small().with_cpus(ARRAY_SLOTS).validate().is_ok());
    }

    #[test]
    fn array_lock_keeps_every_increment_across_trials() {
        let config = small().with_locks([LockType::Array]).with_trials(10);
        assert_eq!(config.expected_count(), 2000);
        let reports = run(&config, |_| ()).unwrap();
        assert_eq!(reports.len(), 10);
        let trials: Vec<_> = reports.iter().map(|report| report.trial).collect();
        assert_eq!(trials, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn mcs_strategies_are_interchangeable() {
        let mcs = [LockType::McsPerThread, LockType::McsTransient, LockType::McsPerCpu];
        let config = small().with_workers(8).with_iterations(300).with_trials(2).with_locks(mcs);
        let mut seen = Vec::new();
        run(&config, |report| seen.push(report.lock)).unwrap();
        assert_eq!(seen, [mcs, mcs].concat());
    }

    #[test]
    fn every_lock_type_finishes_before_deadline() {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let config = small().with_workers(6).with_iterations(50).with_cpus(3).with_trials(1);
            tx.send(run(&config, |_| ()).map(|reports| reports.len())).unwrap();
        });
        let done = rx.recv_timeout(Duration::from_secs(60)).expect("harness did not finish in time");
        assert_eq!(done, Ok(LockType::iter().count()));
    }

    #[test]
    fn every_relax_policy_runs() {
        for relax in RelaxKind::iter() {
            let config = small().with_iterations(50).with_trials(1).with_relax(relax);
            assert!(run(&config, |_| ()).is_ok(), "{relax}");
        }
    }

    #[test]
    fn report_line_format() {
        let report = TrialReport {
            trial: 3,
            lock: LockType::McsPerCpu,
            elapsed: Duration::from_micros(12_750),
            average_ms: 11,
        };
        assert_eq!(report.to_string(), "3) per cpu mcs lock  curr time[ms]=12  avg[ms]=11");
    }

    #[test]
    fn running_average_weights_earlier_trials() {
        assert_eq!(running_average(0, 0, 30), 30);
        assert_eq!(running_average(1, 30, 10), 20);
        assert_eq!(running_average(2, 20, 50), 30);
        assert_eq!(running_average(3, 30, 31), 30);
    }

    #[test]
    fn relax_kinds_parse_from_kebab_case() {
        assert_eq!("yield-backoff".parse::<RelaxKind>(), Ok(RelaxKind::YieldBackoff));
        assert_eq!("spin".parse::<RelaxKind>(), Ok(RelaxKind::Spin));
        assert_eq!(RelaxKind::SpinBackoff.to_string(), "spin-backoff");
    }

    #[test]
    fn errors_chain_their_source() {
        let err = HarnessError::Lock { lock: LockType::Spin, source: LockError::OutOfMemory };
        assert_eq!(err.to_string(), "spin lock failed");
        assert_eq!(err.source().map(ToString::to_string), Some("out of memory".to_string()));
        let err = HarnessError::CounterMismatch {
            lock: LockType::Array,
            trial: 2,
            expected: 2000,
            actual: 1999,
        };
        assert_eq!(err.to_string(), "array lock trial 2: counter is 1999 instead of 2000");
    }
}
