//! Process-wide request and thought counters (C3, §6).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Snapshot returned by `MetricsCollector::snapshot`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_thoughts: u64,
    pub rate_limited_requests: u64,
    pub active_sessions: u64,
    pub uptime_seconds: u64,
}

/// Lock-free counters, one per metric, sampled into a `MetricsSnapshot`.
///
/// Plain atomics rather than a `RwLock<Struct>` like the metrics the engine
/// is modeled on: every field here is an independent monotonic counter, so
/// there is no cross-field invariant a lock would need to protect.
pub struct MetricsCollector {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    total_thoughts: AtomicU64,
    rate_limited_requests: AtomicU64,
    started_at: Instant,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            total_thoughts: AtomicU64::new(0),
            rate_limited_requests: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn record_request_started(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_succeeded(&self) {
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Only called for errors whose kind counts as a failed request
    /// (see `ErrorKind::counts_as_failed_request`, §7).
    pub fn record_request_failed(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_thought_added(&self) {
        self.total_thoughts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, active_sessions: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            total_thoughts: self.total_thoughts.load(Ordering::Relaxed),
            rate_limited_requests: self.rate_limited_requests.load(Ordering::Relaxed),
            active_sessions,
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
