//! Self-observability counters for the ingestion path

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Traces,
    Logs,
    Metrics,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Traces => "traces",
            Signal::Logs => "logs",
            Signal::Metrics => "metrics",
        }
    }
}

#[derive(Debug, Default)]
struct SignalCounters {
    requests: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    duplicates: AtomicU64,
}

#[derive(Debug, Default)]
pub struct IngestCounters {
    traces: SignalCounters,
    logs: SignalCounters,
    metrics: SignalCounters,
    malformed_payloads: AtomicU64,
    storage_errors: AtomicU64,
    overflowed_points: AtomicU64,
}

impl IngestCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn signal(&self, signal: Signal) -> &SignalCounters {
        match signal {
            Signal::Traces => &self.traces,
            Signal::Logs => &self.logs,
            Signal::Metrics => &self.metrics,
        }
    }

    pub fn record_request(&self, signal: Signal) {
        self.signal(signal).requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch(&self, signal: Signal, accepted: usize, rejected: usize, duplicates: usize) {
        let counters = self.signal(signal);
        counters.accepted.fetch_add(accepted as u64, Ordering::Relaxed);
        counters.rejected.fetch_add(rejected as u64, Ordering::Relaxed);
        counters
            .duplicates
            .fetch_add(duplicates as u64, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_payloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_storage_error(&self) {
        self.storage_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overflow(&self, points: usize) {
        self.overflowed_points
            .fetch_add(points as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IngestStats {
        let signal = |s: &SignalCounters| SignalStats {
            requests: s.requests.load(Ordering::Relaxed),
            accepted: s.accepted.load(Ordering::Relaxed),
            rejected: s.rejected.load(Ordering::Relaxed),
            duplicates: s.duplicates.load(Ordering::Relaxed),
        };
        IngestStats {
            traces: signal(&self.traces),
            logs: signal(&self.logs),
            metrics: signal(&self.metrics),
            malformed_payloads: self.malformed_payloads.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
            overflowed_points: self.overflowed_points.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SignalStats {
    pub requests: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub duplicates: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub traces: SignalStats,
    pub logs: SignalStats,
    pub metrics: SignalStats,
    pub malformed_payloads: u64,
    pub storage_errors: u64,
    pub overflowed_points: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let counters = IngestCounters::new();
        counters.record_request(Signal::Traces);
        counters.record_batch(Signal::Traces, 3, 1, 0);
        counters.record_request(Signal::Metrics);
        counters.record_overflow(2);
        counters.record_malformed();

        let stats = counters.snapshot();
        assert_eq!(stats.traces.requests, 1);
        assert_eq!(stats.traces.accepted, 3);
        assert_eq!(stats.traces.rejected, 1);
        assert_eq!(stats.metrics.requests, 1);
        assert_eq!(stats.logs, SignalStats::default());
        assert_eq!(stats.overflowed_points, 2);
        assert_eq!(stats.malformed_payloads, 1);
    }
}
