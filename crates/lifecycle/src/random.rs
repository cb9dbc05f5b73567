use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Source of randomness for stage selection and delay jitter.
pub trait RandomSource: Send + Sync {
    /// Uniform integer in `[0, n)`. `n` is never zero.
    fn below(&self, n: u64) -> u64;

    /// Uniform duration in `[0, d)`, zero when `d` is zero.
    fn duration_below(&self, d: Duration) -> Duration {
        let nanos = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        if nanos == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.below(nanos))
    }
}

/// Thread-local OS-seeded generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn below(&self, n: u64) -> u64 {
        rand::thread_rng().gen_range(0..n)
    }
}

/// Reproducible generator for tests and replayable runs.
#[derive(Debug)]
pub struct SeededRandom(Mutex<StdRng>);

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self(Mutex::new(StdRng::seed_from_u64(seed)))
    }
}

impl RandomSource for SeededRandom {
    fn below(&self, n: u64) -> u64 {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).gen_range(0..n)
    }
}
