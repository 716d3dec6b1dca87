//! Per-task exponential backoff
//!
//! Every task gets its own backoff state, created on its first failure and
//! dropped on its next success. A failure streak on one task never changes
//! the delays of another.

use crate::config::schema::BackoffConfig;
use crate::task::TaskKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Exponential backoff state machine.
///
/// Cheap and deterministic: it never sleeps, callers do.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    multiplier: f64,
    max_interval: Duration,
    max_elapsed: Option<Duration>,
    current: Duration,
    started: Instant,
}

impl ExponentialBackoff {
    pub fn new(config: &BackoffConfig) -> Self {
        let initial = config.initial_interval.max(Duration::from_millis(1));
        let max_interval = config.max_interval.max(initial);
        Self {
            initial,
            multiplier: if config.multiplier.is_finite() && config.multiplier >= 1.0 {
                config.multiplier
            } else {
                1.0
            },
            max_interval,
            max_elapsed: config.max_elapsed,
            current: initial,
            started: Instant::now(),
        }
    }

    /// Next delay, or `None` once the elapsed-time budget is spent.
    ///
    /// Delays are non-decreasing and capped at the max interval.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let delay = self.current;
        self.current =
            Duration::try_from_secs_f64(self.current.as_secs_f64() * self.multiplier)
                .unwrap_or(self.max_interval)
                .min(self.max_interval);
        Some(delay)
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_elapsed
            .is_some_and(|budget| self.started.elapsed() >= budget)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.started = Instant::now();
    }

    pub fn initial_interval(&self) -> Duration {
        self.initial
    }

    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }
}

/// Shared handle to one task's backoff state
#[derive(Debug, Clone)]
pub struct BackoffEntry {
    inner: Arc<Mutex<ExponentialBackoff>>,
}

impl BackoffEntry {
    /// Advance and return the next retry delay.
    ///
    /// Once an elapsed-time budget is spent, retries continue at the max
    /// interval.
    pub fn next_backoff(&self) -> Duration {
        let mut backoff = self.lock();
        backoff
            .next_backoff()
            .unwrap_or_else(|| backoff.max_interval())
    }

    pub fn reset(&self) {
        self.lock().reset();
    }

    fn lock(&self) -> MutexGuard<'_, ExponentialBackoff> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keyed store of per-task backoff state.
///
/// The map lock is only held for lookups; advancing an entry locks that entry
/// alone, so different tasks never wait on each other.
pub struct BackoffRegistry {
    config: BackoffConfig,
    entries: Mutex<HashMap<TaskKey, BackoffEntry>>,
}

impl BackoffRegistry {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Existing entry for `key`, or a fresh one
    pub fn get(&self, key: &TaskKey) -> BackoffEntry {
        self.entries()
            .entry(key.clone())
            .or_insert_with(|| BackoffEntry {
                inner: Arc::new(Mutex::new(ExponentialBackoff::new(&self.config))),
            })
            .clone()
    }

    /// Drop the entry so the next failure starts from the initial interval
    pub fn delete(&self, key: &TaskKey) -> bool {
        self.entries().remove(key).is_some()
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.entries().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<TaskKey, BackoffEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
