//! Metrics collection module
//!
//! Tracks a rolling window of recent remote attempts for the scheduler, plus
//! per-backend counters for reporting.

use crate::backends::BackendKind;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct Attempt {
    success: bool,
    latency: Duration,
}

/// Shared backend metrics
pub struct BackendMetrics {
    /// Total backend attempts
    total_attempts: AtomicU64,
    /// Most recent remote attempts, oldest first
    remote_window: RwLock<VecDeque<Attempt>>,
    window: usize,
    /// Attempt counts per backend
    attempts: RwLock<HashMap<BackendKind, u64>>,
    /// Failure counts per backend
    failures: RwLock<HashMap<BackendKind, u64>>,
}

impl BackendMetrics {
    /// Create a metrics instance keeping the last `window` remote attempts
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            total_attempts: AtomicU64::new(0),
            remote_window: RwLock::new(VecDeque::with_capacity(window)),
            window,
            attempts: RwLock::new(HashMap::new()),
            failures: RwLock::new(HashMap::new()),
        }
    }

    /// Record one backend attempt
    pub fn record(&self, backend: BackendKind, success: bool, latency: Duration) {
        self.total_attempts.fetch_add(1, Ordering::Relaxed);

        {
            let mut attempts = self.attempts.write().unwrap_or_else(PoisonError::into_inner);
            *attempts.entry(backend).or_insert(0) += 1;
        }
        if !success {
            let mut failures = self.failures.write().unwrap_or_else(PoisonError::into_inner);
            *failures.entry(backend).or_insert(0) += 1;
        }

        if backend == BackendKind::Remote {
            let mut window = self
                .remote_window
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if window.len() >= self.window {
                window.pop_front();
            }
            window.push_back(Attempt { success, latency });
        }
    }

    pub fn total_attempts(&self) -> u64 {
        self.total_attempts.load(Ordering::Relaxed)
    }

    pub fn attempts(&self, backend: BackendKind) -> u64 {
        let attempts = self.attempts.read().unwrap_or_else(PoisonError::into_inner);
        attempts.get(&backend).copied().unwrap_or(0)
    }

    pub fn failures(&self, backend: BackendKind) -> u64 {
        let failures = self.failures.read().unwrap_or_else(PoisonError::into_inner);
        failures.get(&backend).copied().unwrap_or(0)
    }

    /// Point-in-time view of the remote window
    pub fn snapshot(&self) -> MetricsSnapshot {
        let window = self
            .remote_window
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let samples = window.len();
        if samples == 0 {
            return MetricsSnapshot::default();
        }

        let failures = window.iter().filter(|a| !a.success).count();
        let total_latency: Duration = window.iter().map(|a| a.latency).sum();
        MetricsSnapshot {
            remote_samples: samples,
            remote_failure_rate: failures as f64 / samples as f64,
            remote_mean_latency: Some(total_latency / samples as u32),
        }
    }
}

impl Default for BackendMetrics {
    fn default() -> Self {
        Self::new(20)
    }
}

/// Remote health as seen by the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub remote_samples: usize,
    /// Fraction of failed attempts in the window, 0 when empty
    pub remote_failure_rate: f64,
    pub remote_mean_latency: Option<Duration>,
}

impl MetricsSnapshot {
    /// Snapshot with a given failure rate, for tests and replays
    pub fn with_failure_rate(samples: usize, rate: f64) -> Self {
        Self {
            remote_samples: samples,
            remote_failure_rate: rate,
            remote_mean_latency: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics() {
        let metrics = BackendMetrics::new(10);

        metrics.record(BackendKind::Remote, true, Duration::from_millis(100));
        metrics.record(BackendKind::Remote, false, Duration::from_millis(300));
        metrics.record(BackendKind::Local, false, Duration::from_millis(50));

        assert_eq!(metrics.total_attempts(), 3);
        assert_eq!(metrics.attempts(BackendKind::Remote), 2);
        assert_eq!(metrics.failures(BackendKind::Local), 1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.remote_samples, 2);
        assert_eq!(snapshot.remote_failure_rate, 0.5);
        assert_eq!(snapshot.remote_mean_latency, Some(Duration::from_millis(200)));
    }

    #[test]
    fn test_window_rolls() {
        let metrics = BackendMetrics::new(3);
        for _ in 0..3 {
            metrics.record(BackendKind::Remote, false, Duration::ZERO);
        }
        assert_eq!(metrics.snapshot().remote_failure_rate, 1.0);

        for _ in 0..3 {
            metrics.record(BackendKind::Remote, true, Duration::ZERO);
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.remote_samples, 3);
        assert_eq!(snapshot.remote_failure_rate, 0.0);
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = BackendMetrics::default().snapshot();
        assert_eq!(snapshot.remote_samples, 0);
        assert_eq!(snapshot.remote_failure_rate, 0.0);
        assert!(snapshot.remote_mean_latency.is_none());
    }
}
