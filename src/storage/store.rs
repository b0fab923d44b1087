//! Storage interface shared by ingestion and query handlers

use serde::Serialize;

use super::memory::MemoryStats;
use crate::otel::{LogRecord, MetricPoint, MetricType, Span};
use crate::query::{
    build_service_map, service_catalog, service_red_metrics, Page, RedMetrics, SearchQuery,
    ServiceMap, ServiceSummary, SpanTree, TimeRange,
};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Retryable: the store cannot take the write right now
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },
}

impl StorageError {
    pub fn trace_not_found(trace_id: &str) -> Self {
        StorageError::NotFound {
            kind: "Trace",
            id: trace_id.to_string(),
        }
    }
}

/// Outcome of one batch write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteSummary {
    pub accepted: usize,
    /// Records already stored under the same identity
    pub duplicates: usize,
    /// Metric points redirected into an overflow series
    pub overflowed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExpiryStats {
    pub spans: usize,
    pub traces: usize,
    pub logs: usize,
    pub metric_points: usize,
    pub series: usize,
}

impl ExpiryStats {
    pub fn total(&self) -> usize {
        self.spans + self.logs + self.metric_points
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub traces: usize,
    pub spans: usize,
    pub logs: usize,
    pub metric_points: usize,
    pub memory: MemoryStats,
    pub ttl_secs: u64,
    pub max_series_per_metric: usize,
}

/// One row of the metric catalog
#[derive(Debug, Clone, Serialize)]
pub struct MetricSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub unit: String,
    pub description: String,
    pub series_count: usize,
    pub services: Vec<String>,
    /// Some points of this metric landed in the overflow series
    pub has_overflow: bool,
}

/// A telemetry backend.
///
/// Writes are idempotent by record identity: span id within its trace, log
/// content hash, metric series plus timestamp. Reads never return records
/// past their expiry.
pub trait TelemetryStore: Send + Sync {
    fn put_spans(&self, spans: Vec<Span>) -> Result<WriteSummary, StorageError>;

    fn put_logs(&self, logs: Vec<LogRecord>) -> Result<WriteSummary, StorageError>;

    fn put_metrics(&self, points: Vec<MetricPoint>) -> Result<WriteSummary, StorageError>;

    /// Every live span of a trace; `NotFound` when none remain
    fn get_trace(&self, trace_id: &str) -> Result<SpanTree, StorageError>;

    /// Traces with a live span overlapping the query range, newest sort key first.
    /// A trace keeps its sort key while live, so pages never repeat a trace.
    fn search_traces(&self, query: &SearchQuery) -> Result<Page<SpanTree>, StorageError>;

    fn search_logs(&self, query: &SearchQuery) -> Result<Page<LogRecord>, StorageError>;

    fn search_metrics(&self, query: &SearchQuery) -> Result<Page<MetricPoint>, StorageError>;

    /// Traces with at least one live span whose `[start, end]` overlaps the range
    fn traces_in_range(&self, range: &TimeRange) -> Result<Vec<SpanTree>, StorageError>;

    fn metric_catalog(&self, include_platform: bool) -> Result<Vec<MetricSummary>, StorageError>;

    /// Drop everything that expired at or before `now`
    fn expire(&self, now: i64) -> ExpiryStats;

    fn stats(&self) -> StoreStats;

    /// Current time on the store's clock, unix nanoseconds
    fn now(&self) -> i64;

    /// Retention window in nanoseconds
    fn ttl_nanos(&self) -> i64;

    fn service_catalog(
        &self,
        range: &TimeRange,
        include_platform: bool,
    ) -> Result<Vec<ServiceSummary>, StorageError> {
        let trees = self.traces_in_range(range)?;
        Ok(service_catalog(&trees, range, include_platform))
    }

    fn list_services(
        &self,
        range: &TimeRange,
        include_platform: bool,
    ) -> Result<Vec<String>, StorageError> {
        Ok(self
            .service_catalog(range, include_platform)?
            .into_iter()
            .map(|s| s.name)
            .collect())
    }

    fn service_red_metrics(
        &self,
        service: &str,
        range: &TimeRange,
    ) -> Result<RedMetrics, StorageError> {
        let trees = self.traces_in_range(range)?;
        Ok(service_red_metrics(&trees, service, range))
    }

    fn service_map(
        &self,
        range: &TimeRange,
        include_platform: bool,
    ) -> Result<ServiceMap, StorageError> {
        let trees = self.traces_in_range(range)?;
        Ok(build_service_map(&trees, range, include_platform))
    }
}
