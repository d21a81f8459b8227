//! Shared metric primitives.
//!
//! Counters are atomic; latency is tracked in a rolling window (last 100
//! samples) and published as an average. Readers always get frozen
//! snapshots, never live references.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

pub const DEFAULT_LATENCY_WINDOW: usize = 100;

/// Rolling latency window. Thread-safe; the mutex is held only for the
/// push/drain, never across an await point.
pub struct LatencyWindow {
    samples: Mutex<VecDeque<u64>>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, duration_ms: u64) {
        let mut samples = self.samples.lock();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(duration_ms);
    }

    pub fn average_ms(&self) -> f64 {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return 0.0;
        }
        let sum: u64 = samples.iter().sum();
        sum as f64 / samples.len() as f64
    }

    pub fn sample_count(&self) -> usize {
        self.samples.lock().len()
    }
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self::new(DEFAULT_LATENCY_WINDOW)
    }
}

/// Success/failure counters plus a latency window, shared by dispatchers
/// and processors.
#[derive(Default)]
pub struct ComponentMetrics {
    processed: AtomicU64,
    failed: AtomicU64,
    latency: LatencyWindow,
}

impl ComponentMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, duration_ms: u64) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.latency.record(duration_ms);
    }

    pub fn record_failure(&self, duration_ms: u64) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.latency.record(duration_ms);
    }

    pub fn snapshot(&self) -> ComponentMetricsSnapshot {
        ComponentMetricsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            average_duration_ms: self.latency.average_ms(),
        }
    }
}

/// Frozen view of a component's counters.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ComponentMetricsSnapshot {
    pub processed: u64,
    pub failed: u64,
    pub average_duration_ms: f64,
}

impl ComponentMetricsSnapshot {
    pub fn total(&self) -> u64 {
        self.processed + self.failed
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            1.0
        } else {
            self.processed as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_averages_zero() {
        let window = LatencyWindow::default();
        assert_eq!(window.average_ms(), 0.0);
        assert_eq!(window.sample_count(), 0);
    }

    #[test]
    fn window_evicts_oldest_sample() {
        let window = LatencyWindow::new(3);
        for ms in [10, 20, 30, 40] {
            window.record(ms);
        }
        assert_eq!(window.sample_count(), 3);
        assert!((window.average_ms() - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn snapshot_is_frozen() {
        let metrics = ComponentMetrics::new();
        metrics.record_success(100);
        let snapshot = metrics.snapshot();
        metrics.record_failure(50);

        assert_eq!(snapshot.processed, 1);
        assert_eq!(snapshot.failed, 0);
        assert_eq!(metrics.snapshot().failed, 1);
    }

    #[test]
    fn success_rate_with_no_traffic_is_one() {
        let metrics = ComponentMetrics::new();
        assert_eq!(metrics.snapshot().success_rate(), 1.0);
        metrics.record_success(5);
        metrics.record_failure(5);
        assert_eq!(metrics.snapshot().success_rate(), 0.5);
    }
}
