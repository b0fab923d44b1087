//! In-memory telemetry store with TTL expiry
//!
//! Spans are grouped per trace in a `DashMap`, so concurrent writers to
//! different traces only contend on a shard. Ordered `(time, id)` indexes
//! back newest-first pagination. Lock order is always trace entry, then
//! index; readers copy keys out of an index and release it before touching
//! trace entries.
//!
//! A trace is indexed under the earliest start of the batch that first made
//! it visible and keeps that key while any of its spans are live, so late
//! spans never move a trace across a page cursor. Range selection uses the
//! live spans' `[start, end]` overlap instead of the key.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::cardinality::{is_overflow, Admission, CardinalityLimiter};
use super::clock::{Clock, SystemClock};
use super::memory::{EstimateSize, MemoryStats, MemoryTracker};
use super::store::{
    ExpiryStats, MetricSummary, StorageError, StoreStats, TelemetryStore, WriteSummary,
};
use crate::otel::{LogRecord, MetricPoint, Span};
use crate::platform::is_visible;
use crate::query::{paginate, Cursor, Filterable, Page, SearchQuery, SpanTree, TimeRange};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Retention for every record, counted from ingestion
    pub ttl: Duration,
    /// Memory budget in estimated bytes
    pub max_bytes: usize,
    /// Live series allowed per metric name
    pub max_series_per_metric: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
            max_bytes: 512 * 1024 * 1024,
            max_series_per_metric: 1000,
        }
    }
}

impl StoreConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_max_series_per_metric(mut self, max_series: usize) -> Self {
        self.max_series_per_metric = max_series;
        self
    }
}

struct Stored<T> {
    record: T,
    expires_at: i64,
    bytes: usize,
}

impl<T> Stored<T> {
    fn is_live(&self, now: i64) -> bool {
        self.expires_at > now
    }
}

#[derive(Default)]
struct TraceEntry {
    spans: Vec<Stored<Span>>,
    /// Time half of the trace's index key; fixed while the trace is live
    sort_time: Option<i64>,
}

impl TraceEntry {
    fn has_live(&self, now: i64) -> bool {
        self.spans.iter().any(|s| s.is_live(now))
    }

    /// Earliest start and latest end over all held spans
    fn bounds(&self) -> Option<(i64, i64)> {
        let start = self.spans.iter().map(|s| s.record.start_time_unix_nano).min()?;
        let end = self.spans.iter().map(|s| s.record.end_time_unix_nano).max()?;
        Some((start, end))
    }

    fn overlaps(&self, range: &TimeRange, now: i64) -> bool {
        self.spans
            .iter()
            .filter(|s| s.is_live(now))
            .any(|s| range.overlaps(s.record.start_time_unix_nano, s.record.end_time_unix_nano))
    }

    fn live_spans(&self, now: i64) -> Vec<Span> {
        self.spans
            .iter()
            .filter(|s| s.is_live(now))
            .map(|s| s.record.clone())
            .collect()
    }
}

/// Sort key shared by every index: `(time, id)`
type RecordKey = (i64, String);

type RecordMap<T> = RwLock<BTreeMap<RecordKey, Stored<T>>>;

fn key_range(range: &TimeRange) -> (Bound<RecordKey>, Bound<RecordKey>) {
    (
        Bound::Included((range.start_time, String::new())),
        Bound::Excluded((range.end_time.saturating_add(1), String::new())),
    )
}

fn record_id(hash: u64) -> String {
    format!("{:016x}", hash)
}

/// Move a trace's index key
fn reindex(index: &RwLock<BTreeSet<RecordKey>>, trace_id: &str, old: Option<i64>, new: Option<i64>) {
    if old == new {
        return;
    }
    let mut index = index.write();
    if let Some(old) = old {
        index.remove(&(old, trace_id.to_string()));
    }
    if let Some(new) = new {
        index.insert((new, trace_id.to_string()));
    }
}

pub struct MemoryStore {
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    traces: DashMap<String, TraceEntry>,
    trace_index: RwLock<BTreeSet<RecordKey>>,
    /// Largest distance any span started before its trace's sort time
    max_lead: AtomicI64,
    /// Largest distance any span ended after its trace's sort time
    max_lag: AtomicI64,
    logs: RecordMap<LogRecord>,
    metrics: RecordMap<MetricPoint>,
    memory: MemoryTracker,
    cardinality: CardinalityLimiter,
}

impl MemoryStore {
    pub fn new(config: StoreConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            memory: MemoryTracker::new(config.max_bytes),
            cardinality: CardinalityLimiter::new(config.max_series_per_metric),
            config,
            clock,
            traces: DashMap::new(),
            trace_index: RwLock::new(BTreeSet::new()),
            max_lead: AtomicI64::new(0),
            max_lag: AtomicI64::new(0),
            logs: RwLock::new(BTreeMap::new()),
            metrics: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn memory_stats(&self) -> MemoryStats {
        MemoryStats::from(&self.memory)
    }

    fn expires_at(&self, now: i64) -> i64 {
        now.saturating_add(self.ttl_nanos())
    }

    /// Reserve budget for a whole batch or reject it untouched
    fn reserve(&self, bytes: usize, count: usize, signal: &'static str) -> Result<(), StorageError> {
        if self.memory.try_allocate(bytes) {
            return Ok(());
        }
        tracing::warn!(
            signal,
            count,
            bytes,
            current = self.memory.current(),
            max = self.memory.max(),
            "Memory budget exhausted, rejecting batch"
        );
        Err(StorageError::Unavailable(format!(
            "memory budget of {} bytes exhausted",
            self.memory.max()
        )))
    }

    fn insert_records<T>(
        &self,
        map: &RecordMap<T>,
        records: Vec<(RecordKey, T, usize)>,
        now: i64,
    ) -> WriteSummary {
        let expires_at = self.expires_at(now);
        let mut summary = WriteSummary::default();
        let mut released = 0;

        let mut map = map.write();
        for (key, record, bytes) in records {
            match map.get_mut(&key) {
                Some(existing) if existing.is_live(now) => {
                    summary.duplicates += 1;
                    released += bytes;
                }
                Some(existing) => {
                    released += existing.bytes;
                    *existing = Stored {
                        record,
                        expires_at,
                        bytes,
                    };
                    summary.accepted += 1;
                }
                None => {
                    map.insert(
                        key,
                        Stored {
                            record,
                            expires_at,
                            bytes,
                        },
                    );
                    summary.accepted += 1;
                }
            }
        }
        drop(map);

        self.memory.free(released);
        summary
    }

    fn search_records<T: Clone + Filterable>(
        map: &RecordMap<T>,
        query: &SearchQuery,
        now: i64,
        service_of: impl Fn(&T) -> &str,
    ) -> Page<T> {
        if query.time_range.start_time > query.time_range.end_time {
            return Page::empty();
        }
        let map = map.read();
        let items = map
            .range(key_range(&query.time_range))
            .rev()
            .filter(|((time, id), stored)| {
                stored.is_live(now)
                    && query.admits(*time, id)
                    && is_visible(service_of(&stored.record), query.include_platform)
                    && query.filters.matches(&stored.record)
            })
            .map(|((time, id), stored)| (Cursor::new(*time, id.clone()), stored.record.clone()));
        paginate(items, query.limit)
    }

    fn expire_records<T>(map: &RecordMap<T>, now: i64, released: &mut usize) -> usize {
        let mut map = map.write();
        let before = map.len();
        map.retain(|_, stored| {
            if stored.is_live(now) {
                true
            } else {
                *released += stored.bytes;
                false
            }
        });
        before - map.len()
    }

    /// Index keys of traces that may overlap `range`, newest first. The key
    /// window is widened by the largest span offsets seen, so callers still
    /// check overlap. The index lock is released on return.
    fn trace_keys(&self, range: &TimeRange) -> Vec<RecordKey> {
        if range.start_time > range.end_time {
            return Vec::new();
        }
        let widened = TimeRange::new(
            range.start_time.saturating_sub(self.max_lag.load(Ordering::Relaxed)),
            range.end_time.saturating_add(self.max_lead.load(Ordering::Relaxed)),
        );
        self.trace_index
            .read()
            .range(key_range(&widened))
            .rev()
            .cloned()
            .collect()
    }

    fn track_offsets(&self, sort_time: i64, entry: &TraceEntry) {
        if let Some((start, end)) = entry.bounds() {
            self.max_lead
                .fetch_max(sort_time.saturating_sub(start).max(0), Ordering::Relaxed);
            self.max_lag
                .fetch_max(end.saturating_sub(sort_time).max(0), Ordering::Relaxed);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl TelemetryStore for MemoryStore {
    fn put_spans(&self, spans: Vec<Span>) -> Result<WriteSummary, StorageError> {
        if spans.is_empty() {
            return Ok(WriteSummary::default());
        }
        let sizes: Vec<usize> = spans.iter().map(EstimateSize::estimated_bytes).collect();
        self.reserve(sizes.iter().sum(), spans.len(), "spans")?;

        let now = self.clock.now_nanos();
        let expires_at = self.expires_at(now);

        let mut by_trace: HashMap<String, Vec<(Span, usize)>> = HashMap::new();
        for (span, bytes) in spans.into_iter().zip(sizes) {
            by_trace
                .entry(span.trace_id.clone())
                .or_default()
                .push((span, bytes));
        }

        let mut summary = WriteSummary::default();
        let mut released = 0;
        for (trace_id, batch) in by_trace {
            let Some(batch_start) = batch.iter().map(|(s, _)| s.start_time_unix_nano).min() else {
                continue;
            };
            let mut entry = self.traces.entry(trace_id.clone()).or_default();
            let was_live = entry.has_live(now);

            for (span, bytes) in batch {
                match entry
                    .spans
                    .iter_mut()
                    .find(|s| s.record.span_id == span.span_id)
                {
                    Some(existing) if existing.is_live(now) => {
                        summary.duplicates += 1;
                        released += bytes;
                    }
                    Some(existing) => {
                        released += existing.bytes;
                        *existing = Stored {
                            record: span,
                            expires_at,
                            bytes,
                        };
                        summary.accepted += 1;
                    }
                    None => {
                        entry.spans.push(Stored {
                            record: span,
                            expires_at,
                            bytes,
                        });
                        summary.accepted += 1;
                    }
                }
            }

            // A live trace keeps its key; one with nothing live is invisible
            // to readers and may take a fresh key. Entry guard is still held.
            let old_time = entry.sort_time;
            let sort_time = match old_time {
                Some(time) if was_live => time,
                _ => batch_start,
            };
            reindex(&self.trace_index, &trace_id, old_time, Some(sort_time));
            entry.sort_time = Some(sort_time);
            self.track_offsets(sort_time, &entry);
        }

        self.memory.free(released);
        tracing::debug!(
            accepted = summary.accepted,
            duplicates = summary.duplicates,
            "Stored spans"
        );
        Ok(summary)
    }

    fn put_logs(&self, logs: Vec<LogRecord>) -> Result<WriteSummary, StorageError> {
        if logs.is_empty() {
            return Ok(WriteSummary::default());
        }
        let records: Vec<(RecordKey, LogRecord, usize)> = logs
            .into_iter()
            .map(|log| {
                let key = (log.time_unix_nano, record_id(log.identity_hash()));
                let bytes = log.estimated_bytes();
                (key, log, bytes)
            })
            .collect();
        self.reserve(records.iter().map(|r| r.2).sum(), records.len(), "logs")?;

        let now = self.clock.now_nanos();
        Ok(self.insert_records(&self.logs, records, now))
    }

    fn put_metrics(&self, points: Vec<MetricPoint>) -> Result<WriteSummary, StorageError> {
        if points.is_empty() {
            return Ok(WriteSummary::default());
        }
        let sizes: Vec<usize> = points.iter().map(EstimateSize::estimated_bytes).collect();
        self.reserve(sizes.iter().sum(), points.len(), "metrics")?;

        let now = self.clock.now_nanos();
        let expires_at = self.expires_at(now);
        let mut overflowed = 0;

        let records: Vec<(RecordKey, MetricPoint, usize)> = points
            .into_iter()
            .zip(sizes)
            .map(|(mut point, bytes)| {
                // Keyed by the original series so overflowed points stay distinct
                let key = (point.time_unix_nano, record_id(point.series_hash()));
                if self.cardinality.admit(&mut point, now, expires_at) == Admission::Overflow {
                    overflowed += 1;
                }
                (key, point, bytes)
            })
            .collect();

        if overflowed > 0 {
            tracing::warn!(
                overflowed,
                max_series = self.cardinality.max_series(),
                "Metric series limit reached, points redirected to overflow series"
            );
        }

        let mut summary = self.insert_records(&self.metrics, records, now);
        summary.overflowed = overflowed;
        Ok(summary)
    }

    fn get_trace(&self, trace_id: &str) -> Result<SpanTree, StorageError> {
        let now = self.clock.now_nanos();
        let spans = self
            .traces
            .get(trace_id)
            .map(|entry| entry.live_spans(now))
            .unwrap_or_default();
        if spans.is_empty() {
            return Err(StorageError::trace_not_found(trace_id));
        }
        Ok(SpanTree::build(spans))
    }

    fn search_traces(&self, query: &SearchQuery) -> Result<Page<SpanTree>, StorageError> {
        let now = self.clock.now_nanos();
        let keys = self.trace_keys(&query.time_range);

        let trees = keys
            .into_iter()
            .filter(|(time, id)| query.is_past_cursor(*time, id))
            .filter_map(|(time, trace_id)| {
                let entry = self.traces.get(&trace_id)?;
                if !entry.overlaps(&query.time_range, now) {
                    return None;
                }
                let spans = entry.live_spans(now);
                drop(entry);
                if spans.is_empty() || !query.filters.matches_any(&spans) {
                    return None;
                }
                let tree = SpanTree::build(spans);
                let root_service = tree.root().map(|r| r.service_name.as_str()).unwrap_or("");
                if !is_visible(root_service, query.include_platform) {
                    return None;
                }
                Some((Cursor::new(time, trace_id), tree))
            });
        Ok(paginate(trees, query.limit))
    }

    fn search_logs(&self, query: &SearchQuery) -> Result<Page<LogRecord>, StorageError> {
        let now = self.clock.now_nanos();
        Ok(Self::search_records(&self.logs, query, now, |log| {
            log.service_name.as_str()
        }))
    }

    fn search_metrics(&self, query: &SearchQuery) -> Result<Page<MetricPoint>, StorageError> {
        let now = self.clock.now_nanos();
        Ok(Self::search_records(&self.metrics, query, now, |point| {
            point.service_name.as_str()
        }))
    }

    fn traces_in_range(&self, range: &TimeRange) -> Result<Vec<SpanTree>, StorageError> {
        let now = self.clock.now_nanos();
        Ok(self
            .trace_keys(range)
            .into_iter()
            .filter_map(|(_, trace_id)| {
                let entry = self.traces.get(&trace_id)?;
                if !entry.overlaps(range, now) {
                    return None;
                }
                let spans = entry.live_spans(now);
                drop(entry);
                Some(SpanTree::build(spans))
            })
            .collect())
    }

    fn metric_catalog(&self, include_platform: bool) -> Result<Vec<MetricSummary>, StorageError> {
        let now = self.clock.now_nanos();
        let mut catalog: BTreeMap<String, (MetricSummary, HashSet<u64>, BTreeSet<String>)> =
            BTreeMap::new();

        let metrics = self.metrics.read();
        for stored in metrics.values().filter(|s| s.is_live(now)) {
            let point = &stored.record;
            if !is_visible(&point.service_name, include_platform) {
                continue;
            }
            let (summary, series, services) =
                catalog.entry(point.name.clone()).or_insert_with(|| {
                    (
                        MetricSummary {
                            name: point.name.clone(),
                            metric_type: point.metric_type,
                            unit: point.unit.clone(),
                            description: point.description.clone(),
                            series_count: 0,
                            services: Vec::new(),
                            has_overflow: false,
                        },
                        HashSet::new(),
                        BTreeSet::new(),
                    )
                });
            series.insert(point.series_hash());
            if !services.contains(&point.service_name) {
                services.insert(point.service_name.clone());
            }
            if is_overflow(&point.attributes) {
                summary.has_overflow = true;
            }
        }
        drop(metrics);

        Ok(catalog
            .into_values()
            .map(|(mut summary, series, services)| {
                summary.series_count = series.len();
                summary.services = services.into_iter().collect();
                summary
            })
            .collect())
    }

    fn expire(&self, now: i64) -> ExpiryStats {
        let mut stats = ExpiryStats::default();
        let mut released = 0;

        self.traces.retain(|trace_id, entry| {
            let before = entry.spans.len();
            entry.spans.retain(|s| {
                if s.is_live(now) {
                    true
                } else {
                    released += s.bytes;
                    false
                }
            });
            let removed = before - entry.spans.len();
            if removed == 0 {
                return true;
            }
            stats.spans += removed;
            if entry.spans.is_empty() {
                reindex(&self.trace_index, trace_id, entry.sort_time, None);
                stats.traces += 1;
                false
            } else {
                true
            }
        });

        stats.logs = Self::expire_records(&self.logs, now, &mut released);
        stats.metric_points = Self::expire_records(&self.metrics, now, &mut released);
        stats.series = self.cardinality.expire(now);
        self.memory.free(released);

        stats
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            traces: self.traces.len(),
            spans: self.traces.iter().map(|e| e.value().spans.len()).sum(),
            logs: self.logs.read().len(),
            metric_points: self.metrics.read().len(),
            memory: self.memory_stats(),
            ttl_secs: self.config.ttl.as_secs(),
            max_series_per_metric: self.config.max_series_per_metric,
        }
    }

    fn now(&self) -> i64 {
        self.clock.now_nanos()
    }

    fn ttl_nanos(&self) -> i64 {
        i64::try_from(self.config.ttl.as_nanos()).unwrap_or(i64::MAX)
    }
}
