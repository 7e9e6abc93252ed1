//! Queue client metrics.
//!
//! Counters are atomics; handler run times are kept in a bounded sample
//! window for P50/P95/P99.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::message::Disposition;

/// Maximum number of run-time samples kept.
const MAX_SAMPLES: usize = 1000;

/// Per-client counters.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    /// Messages submitted.
    pub submitted: AtomicU64,
    /// Fan-out messages published.
    pub published: AtomicU64,
    /// Messages received from the backend.
    pub received: AtomicU64,
    /// Messages acknowledged after a successful run.
    pub completed: AtomicU64,
    /// Messages deleted after a permanent failure.
    pub failed: AtomicU64,
    /// Messages made visible again after a transient failure.
    pub retried: AtomicU64,
    /// Messages discarded because `endTime` passed.
    pub expired: AtomicU64,
    /// Messages put back because `startTime` is in the future.
    pub deferred: AtomicU64,
    /// Messages removed explicitly or because they were malformed.
    pub dropped: AtomicU64,
    /// Processing entries recovered by the monitor.
    pub recovered: AtomicU64,
    /// Times the ready set grew past the warning threshold.
    pub threshold_warnings: AtomicU64,
    /// Early acknowledgments the backend rejected.
    pub ack_failures: AtomicU64,
    samples: Mutex<VecDeque<Duration>>,
}

impl QueueMetrics {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump a counter.
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Add to a counter.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Record a handler run and its disposition.
    pub fn record_run(&self, elapsed: Duration, disposition: &Disposition) {
        match disposition {
            Disposition::Complete => Self::incr(&self.completed),
            Disposition::Discard { .. } => Self::incr(&self.failed),
            Disposition::Retry { .. } => Self::incr(&self.retried),
        }
        if let Ok(mut samples) = self.samples.lock() {
            if samples.len() >= MAX_SAMPLES {
                samples.pop_front();
            }
            samples.push_back(elapsed);
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self, name: &str, driver: &str) -> QueueStats {
        let mut sorted: Vec<Duration> = self
            .samples
            .lock()
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        sorted.sort();
        let percentile = |p: usize| -> Option<u64> {
            if sorted.is_empty() {
                return None;
            }
            let idx = (sorted.len() - 1) * p / 100;
            sorted.get(idx).map(|d| d.as_millis() as u64)
        };

        QueueStats {
            name: name.to_string(),
            driver: driver.to_string(),
            submitted: self.submitted.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
            threshold_warnings: self.threshold_warnings.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            run_p50_ms: percentile(50),
            run_p95_ms: percentile(95),
            run_p99_ms: percentile(99),
            sample_count: sorted.len() as u64,
        }
    }
}

/// Serializable view of a client's metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub name: String,
    pub driver: String,
    pub submitted: u64,
    pub published: u64,
    pub received: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub expired: u64,
    pub deferred: u64,
    pub dropped: u64,
    pub recovered: u64,
    pub threshold_warnings: u64,
    pub ack_failures: u64,
    pub run_p50_ms: Option<u64>,
    pub run_p95_ms: Option<u64>,
    pub run_p99_ms: Option<u64>,
    pub sample_count: u64,
}
