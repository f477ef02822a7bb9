//! Process-wide request counters exposed on the debug endpoint.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// How often, in requests, the live task count is sampled.
pub const TASK_SAMPLE_EVERY: u64 = 1000;

/// Counters updated by the metrics middleware.
#[derive(Debug, Default)]
pub struct Metrics {
    requests: AtomicU64,
    errors: AtomicU64,
    panics: AtomicU64,
    tasks: AtomicU64,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Requests handled.
    pub requests: u64,
    /// Requests that ended in an error.
    pub errors: u64,
    /// Recovered panics.
    pub panics: u64,
    /// Live runtime tasks at the last sample.
    pub tasks: u64,
}

impl Metrics {
    /// All counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a request and returns the new total. Every
    /// [`TASK_SAMPLE_EVERY`] requests the runtime's live task count is
    /// recorded as well.
    pub fn add_request(&self) -> u64 {
        let n = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        if n % TASK_SAMPLE_EVERY == 0 {
            self.sample_tasks();
        }
        n
    }

    /// Counts an error and returns the new total.
    pub fn add_error(&self) -> u64 {
        self.errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Counts a panic and returns the new total.
    pub fn add_panic(&self) -> u64 {
        self.panics.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn sample_tasks(&self) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let alive = handle.metrics().num_alive_tasks() as u64;
            self.tasks.store(alive, Ordering::Relaxed);
        }
    }

    /// Reads every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
            tasks: self.tasks.load(Ordering::Relaxed),
        }
    }
}
