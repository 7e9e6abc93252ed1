//! Pool metrics and telemetry.
//!
//! Counters are atomics so they can be bumped from any task without taking
//! the pool lock.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Cumulative pool counters.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// Resources created.
    pub created: AtomicU64,
    /// Resources destroyed.
    pub destroyed: AtomicU64,
    /// Successful acquisitions.
    pub acquired: AtomicU64,
    /// Releases handed directly to a waiting caller.
    pub handoffs: AtomicU64,
    /// Acquisitions that gave up waiting.
    pub timeouts: AtomicU64,
    /// Acquisitions rejected because the wait queue was full.
    pub exhausted: AtomicU64,
    /// Failed create hook calls.
    pub create_failures: AtomicU64,
}

impl PoolMetrics {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// A point-in-time view of a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    /// Pool name.
    pub name: String,
    /// Idle resources ready for reuse.
    pub idle: usize,
    /// Resources handed out (including ones being created).
    pub busy: usize,
    /// Busy resources that will be destroyed on release.
    pub pending_destroy: usize,
    /// Callers waiting for a resource.
    pub waiting: usize,
    /// Whether the pool has been shut down.
    pub closed: bool,
    /// Resources created.
    pub created: u64,
    /// Resources destroyed.
    pub destroyed: u64,
    /// Successful acquisitions.
    pub acquired: u64,
    /// Direct hand-offs to waiters.
    pub handoffs: u64,
    /// Wait timeouts.
    pub timeouts: u64,
    /// Rejections with a full wait queue.
    pub exhausted: u64,
    /// Create hook failures.
    pub create_failures: u64,
}

impl PoolStats {
    pub(crate) fn counters(mut self, metrics: &PoolMetrics) -> Self {
        self.created = metrics.created.load(Ordering::Relaxed);
        self.destroyed = metrics.destroyed.load(Ordering::Relaxed);
        self.acquired = metrics.acquired.load(Ordering::Relaxed);
        self.handoffs = metrics.handoffs.load(Ordering::Relaxed);
        self.timeouts = metrics.timeouts.load(Ordering::Relaxed);
        self.exhausted = metrics.exhausted.load(Ordering::Relaxed);
        self.create_failures = metrics.create_failures.load(Ordering::Relaxed);
        self
    }
}
