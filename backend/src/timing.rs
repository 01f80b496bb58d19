//! Scoped wall-clock measurement recorded into a shared map of named
//! durations.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// Shared map from a timing key to elapsed seconds. Cloning shares the map.
#[derive(Debug, Clone, Default)]
pub struct ProcessingTimes {
    inner: Arc<Mutex<BTreeMap<String, f64>>>,
}

impl ProcessingTimes {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, f64>> {
        // A panic while holding the lock leaves a map that is still valid.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Overwrites any earlier value for `key`.
    pub fn record(&self, key: &str, seconds: f64) {
        self.lock().insert(key.to_string(), seconds);
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.lock().get(key).copied()
    }

    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        self.lock().clone()
    }
}

/// Records the time between `start` and drop, on every exit path.
#[must_use = "the timer records when dropped"]
pub struct Timer {
    description: String,
    key: String,
    times: ProcessingTimes,
    start: Instant,
}

impl Timer {
    pub fn start(description: impl Into<String>, times: &ProcessingTimes, key: &str) -> Self {
        Self {
            description: description.into(),
            key: key.to_string(),
            times: times.clone(),
            start: Instant::now(),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed().as_secs_f64();
        self.times.record(&self.key, elapsed);
        log::info!("{} took: {:.4} seconds", self.description, elapsed);
    }
}

/// Runs `work` under a [`Timer`].
pub fn timed<T>(
    description: impl Into<String>,
    times: &ProcessingTimes,
    key: &str,
    work: impl FnOnce() -> T,
) -> T {
    let _timer = Timer::start(description, times, key);
    work()
}
