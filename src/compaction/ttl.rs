use crate::storage::{ExpiryStats, TelemetryStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

/// Shortest sweep interval; `tokio::time::interval` panics on zero
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Background sweep that removes expired telemetry from the store
pub struct TtlWorker {
    store: Arc<dyn TelemetryStore>,
    interval: Duration,
    running: Arc<AtomicBool>,
}

impl TtlWorker {
    pub fn new(store: Arc<dyn TelemetryStore>, interval: Duration) -> Self {
        if interval.is_zero() {
            tracing::warn!(
                "TTL sweep interval of zero is not allowed, using {:?}",
                MIN_SWEEP_INTERVAL
            );
        }
        Self {
            store,
            interval: if interval.is_zero() { MIN_SWEEP_INTERVAL } else { interval },
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the background worker
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            tracing::info!("TTL worker started with interval {:?}", self.interval);

            let mut interval = time::interval(self.interval);
            // The first tick completes immediately
            interval.tick().await;

            while self.running.load(Ordering::SeqCst) {
                interval.tick().await;
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                run_ttl_expiration(self.store.as_ref());
            }

            tracing::info!("TTL worker stopped");
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Run one sweep at the store's current time
pub fn run_ttl_expiration(store: &dyn TelemetryStore) -> ExpiryStats {
    let expired = store.expire(store.now());
    if expired.total() > 0 {
        tracing::info!(
            spans = expired.spans,
            traces = expired.traces,
            logs = expired.logs,
            metric_points = expired.metric_points,
            series = expired.series,
            "TTL worker expired telemetry"
        );
    }
    expired
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::tree::tests::make_span;
    use crate::storage::{ManualClock, MemoryStore, StoreConfig};

    #[test]
    fn test_run_ttl_expiration() {
        let clock = Arc::new(ManualClock::new(1_000_000_000_000));
        let store = MemoryStore::with_clock(
            StoreConfig::default().with_ttl(Duration::from_secs(10)),
            clock.clone(),
        );
        store
            .put_spans(vec![make_span("a", None, "api", "GET /", 0, 10)])
            .unwrap();

        assert_eq!(run_ttl_expiration(&store).total(), 0);

        clock.advance_secs(11);
        let expired = run_ttl_expiration(&store);
        assert_eq!(expired.spans, 1);
        assert_eq!(expired.traces, 1);
        assert_eq!(store.stats().spans, 0);
    }

    #[tokio::test]
    async fn test_worker_sweeps_and_stops() {
        let clock = Arc::new(ManualClock::new(1_000_000_000_000));
        let store = Arc::new(MemoryStore::with_clock(
            StoreConfig::default().with_ttl(Duration::from_secs(10)),
            clock.clone(),
        ));
        store
            .put_spans(vec![make_span("a", None, "api", "GET /", 0, 10)])
            .unwrap();
        clock.advance_secs(11);

        let worker = Arc::new(TtlWorker::new(store.clone(), Duration::from_millis(20)));
        let handle = worker.clone().start();

        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.stats().traces, 0);

        worker.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_interval_is_clamped() {
        let store = Arc::new(MemoryStore::new(StoreConfig::default()));
        let worker = Arc::new(TtlWorker::new(store, Duration::ZERO));
        assert_eq!(worker.interval, MIN_SWEEP_INTERVAL);

        let handle = worker.clone().start();
        time::sleep(Duration::from_millis(50)).await;
        worker.stop();
        assert!(handle.await.is_ok());
    }
}
