use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Exponential backoff parameters shared by every item of a [`BackoffSet`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub initial: Duration,
    /// Multiplier applied on each failure; values below 1 are treated as 1.
    pub factor: f64,
    /// Extra random fraction in `[0, jitter)` of the period added on each step.
    pub jitter: f64,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { initial: Duration::from_secs(1), factor: 2.0, jitter: 0.1, max: Duration::from_secs(60) }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
}

impl BackoffConfig {
    /// Defaults overridden by `FAKELET_BACKOFF_INITIAL_MS`, `FAKELET_BACKOFF_FACTOR`,
    /// `FAKELET_BACKOFF_JITTER` and `FAKELET_BACKOFF_MAX_MS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            initial: env_parse::<u64>("FAKELET_BACKOFF_INITIAL_MS").map(Duration::from_millis).unwrap_or(d.initial),
            factor: env_parse("FAKELET_BACKOFF_FACTOR").unwrap_or(d.factor),
            jitter: env_parse("FAKELET_BACKOFF_JITTER").unwrap_or(d.jitter),
            max: env_parse::<u64>("FAKELET_BACKOFF_MAX_MS").map(Duration::from_millis).unwrap_or(d.max),
        }
    }

    fn factor(&self) -> f64 {
        if self.factor.is_finite() && self.factor >= 1.0 { self.factor } else { 1.0 }
    }

    fn jitter(&self) -> f64 {
        if self.jitter.is_finite() && self.jitter > 0.0 { self.jitter } else { 0.0 }
    }

    /// Period following `prev` (or the first period when `prev` is `None`),
    /// jittered and capped at `max`.
    fn step(&self, prev: Option<Duration>, rng: &mut StdRng) -> Duration {
        let base = match prev {
            None => self.initial.as_secs_f64(),
            Some(p) => p.as_secs_f64() * self.factor(),
        };
        let jitter = self.jitter();
        let jittered = if jitter > 0.0 { base + rng.gen_range(0.0..jitter) * base } else { base };
        Duration::from_secs_f64(jittered.min(self.max.as_secs_f64()).max(0.0))
    }
}

/// Independent exponential backoff period per retrying item.
pub struct BackoffSet<K> {
    config: BackoffConfig,
    entries: Mutex<FxHashMap<K, Duration>>,
    rng: Mutex<StdRng>,
}

impl<K: Hash + Eq + Clone> BackoffSet<K> {
    pub fn new(config: BackoffConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Deterministic jitter for tests.
    pub fn with_rng(config: BackoffConfig, rng: StdRng) -> Self {
        Self { config, entries: Mutex::new(FxHashMap::default()), rng: Mutex::new(rng) }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Record a failure for `key` and return the period to wait before retrying.
    pub fn add_or_update(&self, key: &K) -> Duration {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let next = self.config.step(entries.get(key).copied(), &mut rng);
        entries.insert(key.clone(), next);
        next
    }

    pub fn get(&self, key: &K) -> Option<Duration> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).get(key).copied()
    }

    /// Forget `key`; the next failure starts again from the initial period.
    pub fn remove(&self, key: &K) -> bool {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffConfig {
        BackoffConfig { initial: Duration::from_secs(10), factor: 2.0, jitter: 0.0, max: Duration::from_secs(30) }
    }

    #[test]
    fn sequence_doubles_until_capped() {
        let set = BackoffSet::new(no_jitter());
        let got: Vec<u64> = (0..5).map(|_| set.add_or_update(&"job").as_secs()).collect();
        assert_eq!(got, vec![10, 20, 30, 30, 30]);
        assert_eq!(set.get(&"job"), Some(Duration::from_secs(30)));
    }

    #[test]
    fn remove_resets_to_initial() {
        let set = BackoffSet::new(no_jitter());
        set.add_or_update(&"a");
        set.add_or_update(&"a");
        assert!(set.remove(&"a"));
        assert!(!set.remove(&"a"));
        assert_eq!(set.add_or_update(&"a"), Duration::from_secs(10));
    }

    #[test]
    fn items_back_off_independently() {
        let set = BackoffSet::new(no_jitter());
        set.add_or_update(&"a");
        set.add_or_update(&"a");
        assert_eq!(set.add_or_update(&"b"), Duration::from_secs(10));
        assert_eq!(set.get(&"a"), Some(Duration::from_secs(20)));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn jitter_stays_within_bounds_and_cap() {
        let cfg = BackoffConfig { initial: Duration::from_millis(100), factor: 2.0, jitter: 0.5, max: Duration::from_secs(1) };
        let set = BackoffSet::with_rng(cfg, StdRng::seed_from_u64(7));
        let first = set.add_or_update(&1u32);
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(150), "first={:?}", first);
        for _ in 0..20 {
            assert!(set.add_or_update(&1u32) <= Duration::from_secs(1));
        }
    }

    #[test]
    fn degenerate_factor_is_clamped() {
        let cfg = BackoffConfig { initial: Duration::from_secs(1), factor: 0.1, jitter: -1.0, max: Duration::from_secs(5) };
        let set = BackoffSet::new(cfg);
        assert_eq!(set.add_or_update(&"x"), Duration::from_secs(1));
        assert_eq!(set.add_or_update(&"x"), Duration::from_secs(1));
    }
}
