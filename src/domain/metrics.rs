//! Per-connection metric accumulators.
//!
//! Byte counters are fed by provider adapters (or by the manager when it
//! learns about traffic); latency samples come from the metrics collector's
//! probes or from adapters that measure their own round trips. The latency
//! history is bounded so memory use stays flat over long uptimes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::domain::connection::epoch_millis;

struct LatencyHistory {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl LatencyHistory {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    fn record(&mut self, latency_ms: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    fn last(&self) -> Option<u64> {
        self.samples.back().copied()
    }

    fn mean(&self) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        let sum: u64 = self.samples.iter().sum();
        sum / self.samples.len() as u64
    }
}

/// Counters and gauges for one connection.
pub struct ConnectionMetrics {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    failure_count: AtomicU32,
    history: Mutex<LatencyHistory>,
    last_update_ms: AtomicU64,
    started_at: DateTime<Utc>,
}

impl ConnectionMetrics {
    pub(crate) fn new(history_size: usize) -> Self {
        Self {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            failure_count: AtomicU32::new(0),
            history: Mutex::new(LatencyHistory::new(history_size)),
            last_update_ms: AtomicU64::new(epoch_millis()),
            started_at: Utc::now(),
        }
    }

    /// Record a successful latency probe.
    ///
    /// Resets the consecutive-failure gauge.
    pub fn record_latency(&self, latency: Duration) {
        self.history.lock().record(latency.as_millis() as u64);
        self.failure_count.store(0, Ordering::Relaxed);
        self.stamp();
    }

    /// Record a failed latency probe.
    ///
    /// The history is left untouched so one bad probe does not poison the
    /// rolling average. Returns the new consecutive-failure count.
    pub fn record_probe_failure(&self) -> u32 {
        self.stamp();
        self.failure_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Add bytes flowing towards the remote end.
    pub fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
        self.stamp();
    }

    /// Add bytes flowing from the remote end.
    pub fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
        self.stamp();
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Most recent latency sample in milliseconds; zero when none recorded.
    pub fn latency_ms(&self) -> u64 {
        self.history.lock().last().unwrap_or(0)
    }

    /// Mean of the retained latency samples; zero when none recorded.
    pub fn avg_latency_ms(&self) -> u64 {
        self.history.lock().mean()
    }

    /// Number of retained latency samples.
    pub fn sample_count(&self) -> usize {
        self.history.lock().samples.len()
    }

    /// Consecutive failed latency probes since the last success.
    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Relaxed)
    }

    pub fn last_update(&self) -> DateTime<Utc> {
        let ms = self.last_update_ms.load(Ordering::Relaxed);
        DateTime::<Utc>::from_timestamp_millis(ms as i64).unwrap_or_default()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    fn stamp(&self) {
        self.last_update_ms.store(epoch_millis(), Ordering::Relaxed);
    }
}
