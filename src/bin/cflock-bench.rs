//! Runs the lock benchmark and prints one report line per trial and lock.
//!
//! Set `CFLOCK_LOG` to `error`, `warn`, `info`, `debug` or `trace` to see the
//! library logs on stderr.

use std::error::Error;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::{Level, LevelFilter, Log, Metadata, Record};

use cflock::harness::{self, Config, RelaxKind};
use cflock::registry::LockType;

/// Validates and times every lock type with many concurrent workers.
#[derive(Debug, Parser)]
#[command(name = "cflock-bench", version, about)]
struct Args {
    /// Concurrent workers per run.
    #[arg(long, short, default_value_t = Config::DEFAULT_WORKERS)]
    workers: usize,

    /// Acquire, increment, release cycles per worker.
    #[arg(long, short, default_value_t = Config::DEFAULT_ITERATIONS)]
    iterations: usize,

    /// Logical cores the workers are spread over.
    #[arg(long, short, default_value_t = Config::DEFAULT_CPUS)]
    cpus: usize,

    /// Warm-up delay before every run, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    warmup_ms: u64,

    /// Rounds over the lock types.
    #[arg(long, short, default_value_t = Config::DEFAULT_TRIALS)]
    trials: usize,

    /// Lock type to run, repeatable: spin, array, mcs-per-thread,
    /// mcs-transient or mcs-per-cpu. Runs all of them by default.
    #[arg(long = "lock", short, value_name = "TYPE")]
    locks: Vec<LockType>,

    /// Busy-wait policy: spin, spin-backoff, yield, yield-backoff or loop.
    #[arg(long, short, default_value_t = RelaxKind::Spin)]
    relax: RelaxKind,
}

impl Args {
    fn into_config(self) -> Config {
        let config = Config::default()
            .with_workers(self.workers)
            .with_iterations(self.iterations)
            .with_cpus(self.cpus)
            .with_warmup(Duration::from_millis(self.warmup_ms))
            .with_trials(self.trials)
            .with_relax(self.relax);
        if self.locks.is_empty() {
            config
        } else {
            config.with_locks(self.locks)
        }
    }
}

/// Writes log records to stderr with a colored level tag.
struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let color = level_to_color_code(record.level());
        eprintln!("\u{1B}[{color}m[{:>5}]\u{1B}[0m {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

fn level_to_color_code(level: Level) -> u8 {
    match level {
        Level::Error => 31, // Red
        Level::Warn => 93,  // BrightYellow
        Level::Info => 34,  // Blue
        Level::Debug => 32, // Green
        Level::Trace => 90, // BrightBlack
    }
}

/// Installs the stderr logger at the level named by `CFLOCK_LOG`, off if it
/// is unset or unknown.
fn init_logger() {
    static LOGGER: StderrLogger = StderrLogger;
    let level = std::env::var("CFLOCK_LOG")
        .ok()
        .and_then(|level| level.parse().ok())
        .unwrap_or(LevelFilter::Off);
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

fn main() -> ExitCode {
    init_logger();
    let config = Args::parse().into_config();
    match harness::run(&config, |report| println!("{report}")) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("cflock-bench: {err}");
            let mut source = err.source();
            while let Some(cause) = source {
                eprintln!("  caused by: {cause}");
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}
