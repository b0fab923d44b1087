//! RED metrics (rate, errors, duration) derived from stored spans

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use super::request::TimeRange;
use super::tree::SpanTree;
use crate::otel::SpanKind;
use crate::platform::is_visible;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RedMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Requests per second over the queried range
    pub rate: f64,
    /// Fraction of requests with error status, 0.0 to 1.0
    pub error_rate: f64,
    pub duration_p50_ms: f64,
    pub duration_p95_ms: f64,
    pub duration_p99_ms: f64,
}

/// Nearest-rank percentile over sorted values
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

#[derive(Debug, Default)]
struct RedAccumulator {
    errors: u64,
    durations_ms: Vec<f64>,
}

impl RedAccumulator {
    fn push(&mut self, duration_ms: f64, is_error: bool) {
        self.durations_ms.push(duration_ms);
        if is_error {
            self.errors += 1;
        }
    }

    fn finish(mut self, range: &TimeRange) -> RedMetrics {
        let count = self.durations_ms.len() as u64;
        if count == 0 {
            return RedMetrics::default();
        }
        self.durations_ms.sort_by(|a, b| a.total_cmp(b));
        RedMetrics {
            request_count: count,
            error_count: self.errors,
            rate: count as f64 / range.duration_secs(),
            error_rate: self.errors as f64 / count as f64,
            duration_p50_ms: percentile(&self.durations_ms, 50.0),
            duration_p95_ms: percentile(&self.durations_ms, 95.0),
            duration_p99_ms: percentile(&self.durations_ms, 99.0),
        }
    }
}

/// A span counts as a request into its service when it is a server or
/// consumer span, a root, or its parent belongs to another service.
fn is_entry(tree: &SpanTree, index: usize) -> bool {
    let span = tree.span(index);
    if matches!(span.kind, SpanKind::Server | SpanKind::Consumer) {
        return true;
    }
    match tree.parent(index) {
        None => true,
        Some(p) => tree.span(p).service_name != span.service_name,
    }
}

#[derive(Debug, Default)]
struct ServiceAccumulator {
    entries: RedAccumulator,
    all: RedAccumulator,
    span_count: u64,
    operations: BTreeSet<String>,
    first_seen: i64,
    last_seen: i64,
}

impl ServiceAccumulator {
    fn finish(self, range: &TimeRange) -> (RedMetrics, u64, usize, i64, i64) {
        // Services that only ever appear as internal work still get numbers
        let red = if self.entries.durations_ms.is_empty() {
            self.all.finish(range)
        } else {
            self.entries.finish(range)
        };
        (
            red,
            self.span_count,
            self.operations.len(),
            self.first_seen,
            self.last_seen,
        )
    }
}

fn accumulate<'a>(
    trees: impl IntoIterator<Item = &'a SpanTree>,
    range: &TimeRange,
    wanted: impl Fn(&str) -> bool,
) -> BTreeMap<String, ServiceAccumulator> {
    let mut services: BTreeMap<String, ServiceAccumulator> = BTreeMap::new();
    for tree in trees {
        for (index, span) in tree.spans().iter().enumerate() {
            if !range.contains(span.start_time_unix_nano) || !wanted(&span.service_name) {
                continue;
            }
            let acc = services
                .entry(span.service_name.clone())
                .or_insert_with(|| ServiceAccumulator {
                    first_seen: span.start_time_unix_nano,
                    last_seen: span.end_time_unix_nano,
                    ..Default::default()
                });
            acc.span_count += 1;
            acc.first_seen = acc.first_seen.min(span.start_time_unix_nano);
            acc.last_seen = acc.last_seen.max(span.end_time_unix_nano);
            if !acc.operations.contains(&span.operation_name) {
                acc.operations.insert(span.operation_name.clone());
            }
            acc.all.push(span.duration_ms(), span.is_error());
            if is_entry(tree, index) {
                acc.entries.push(span.duration_ms(), span.is_error());
            }
        }
    }
    services
}

/// RED metrics for one service; all zero when it has no spans in range
pub fn service_red_metrics<'a>(
    trees: impl IntoIterator<Item = &'a SpanTree>,
    service: &str,
    range: &TimeRange,
) -> RedMetrics {
    accumulate(trees, range, |name| name == service)
        .remove(service)
        .map(|acc| acc.finish(range).0)
        .unwrap_or_default()
}

/// RED metrics for every service, keyed by name
pub fn red_by_service<'a>(
    trees: impl IntoIterator<Item = &'a SpanTree>,
    range: &TimeRange,
    include_platform: bool,
) -> BTreeMap<String, RedMetrics> {
    accumulate(trees, range, |name| is_visible(name, include_platform))
        .into_iter()
        .map(|(name, acc)| {
            let red = acc.finish(range).0;
            (name, red)
        })
        .collect()
}

/// One row of the service catalog
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSummary {
    pub name: String,
    #[serde(flatten)]
    pub red: RedMetrics,
    pub span_count: u64,
    pub operation_count: usize,
    pub first_seen: i64,
    pub last_seen: i64,
}

/// Service catalog sorted by name
pub fn service_catalog<'a>(
    trees: impl IntoIterator<Item = &'a SpanTree>,
    range: &TimeRange,
    include_platform: bool,
) -> Vec<ServiceSummary> {
    accumulate(trees, range, |name| is_visible(name, include_platform))
        .into_iter()
        .map(|(name, acc)| {
            let (red, span_count, operation_count, first_seen, last_seen) = acc.finish(range);
            ServiceSummary {
                name,
                red,
                span_count,
                operation_count,
                first_seen,
                last_seen,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::otel::{SpanKind, SpanStatus};
    use crate::query::tree::tests::make_span;

    const MS: i64 = 1_000_000;

    fn sample_trees() -> Vec<SpanTree> {
        (0..10)
            .map(|i| {
                let start = i * 100 * MS;
                let mut root = make_span("a", None, "frontend", "GET /", start, start + (i + 1) * 10 * MS);
                if i == 0 {
                    root.status_code = SpanStatus::Error;
                }
                let mut child = make_span("b", Some("a"), "backend", "compute", start, start + MS);
                child.kind = SpanKind::Internal;
                let inner = make_span("c", Some("b"), "backend", "helper", start, start + MS);
                SpanTree::build(vec![root, child, inner])
            })
            .collect()
    }

    #[test]
    fn test_percentile() {
        let values: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        assert_eq!(percentile(&values, 50.0), 51.0);
        assert_eq!(percentile(&values, 99.0), 99.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
        assert_eq!(percentile(&[7.0], 95.0), 7.0);
    }

    #[test]
    fn test_service_red_metrics() {
        let trees = sample_trees();
        let range = TimeRange::new(0, 1_000 * MS);
        let red = service_red_metrics(&trees, "frontend", &range);

        assert_eq!(red.request_count, 10);
        assert_eq!(red.error_count, 1);
        assert!((red.error_rate - 0.1).abs() < 1e-9);
        assert!((red.rate - 10.0).abs() < 1e-9);
        assert_eq!(red.duration_p50_ms, 60.0);
        assert_eq!(red.duration_p99_ms, 100.0);
    }

    #[test]
    fn test_only_entry_spans_count_as_requests() {
        let trees = sample_trees();
        let range = TimeRange::new(0, 1_000 * MS);
        let red = service_red_metrics(&trees, "backend", &range);
        // "helper" is nested inside backend's own span
        assert_eq!(red.request_count, 10);
    }

    #[test]
    fn test_unknown_service_is_zero() {
        let trees = sample_trees();
        let red = service_red_metrics(&trees, "nope", &TimeRange::new(0, 1));
        assert_eq!(red, RedMetrics::default());
    }

    #[test]
    fn test_service_catalog() {
        let trees = sample_trees();
        let mut platform = make_span("p", None, "ollyscale-receiver", "export", 0, MS);
        platform.trace_id = "0".repeat(32);
        let mut all = trees.clone();
        all.push(SpanTree::build(vec![platform]));

        let range = TimeRange::new(0, 1_000 * MS);
        let catalog = service_catalog(&all, &range, false);
        let names: Vec<&str> = catalog.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["backend", "frontend"]);
        assert_eq!(catalog[0].operation_count, 2);
        assert_eq!(catalog[0].span_count, 20);
        assert_eq!(catalog[1].first_seen, 0);

        let with_platform = service_catalog(&all, &range, true);
        assert_eq!(with_platform.len(), 3);
    }
}
