//! Conversion from OTLP JSON requests into stored records
//!
//! Conversion is best effort: a record that fails to parse, carries an
//! invalid identifier, or is otherwise unusable is skipped and counted, and
//! the rest of the batch goes through.

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use super::ids::{normalize_id, normalize_optional_id, IdError, IdKind};
use super::model::{
    severity_text_for, AttributeValue, LogRecord, MetricPoint, MetricType, Resource, Span,
    SpanEvent, SpanKind, SpanLink, SpanStatus,
};
use super::otlp_json::{
    self, attributes_from, DistributionDataPoint, ExportLogsServiceRequest,
    ExportMetricsServiceRequest, ExportTraceServiceRequest, NumberDataPoint,
};

/// Service name used when a resource carries no `service.name`
pub const UNKNOWN_SERVICE: &str = "unknown_service";

/// Why a single record was dropped
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    InvalidIdentifier(#[from] IdError),

    #[error("span ends before it starts ({0} ns)")]
    NegativeDuration(i64),

    #[error("span timestamps out of range")]
    TimestampOutOfRange,

    #[error("data point has no value")]
    MissingValue,

    #[error("metric '{0}' has no data")]
    EmptyMetric(String),
}

/// Records decoded from one export request, plus what had to be skipped
#[derive(Debug)]
pub struct Decoded<T> {
    pub items: Vec<T>,
    pub rejected: usize,
    pub first_error: Option<String>,
}

impl<T> Default for Decoded<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            rejected: 0,
            first_error: None,
        }
    }
}

impl<T> Decoded<T> {
    fn reject(&mut self, err: RecordError) {
        self.reject_many(1, err);
    }

    fn reject_many(&mut self, count: usize, err: RecordError) {
        tracing::debug!("Skipping {} telemetry record(s): {}", count, err);
        self.rejected += count;
        if self.first_error.is_none() {
            self.first_error = Some(err.to_string());
        }
    }

    fn push(&mut self, result: Result<T, RecordError>) {
        match result {
            Ok(item) => self.items.push(item),
            Err(e) => self.reject(e),
        }
    }
}

/// Parse one resource or scope envelope. A malformed envelope rejects the
/// records under `leaves`, counted as at least one.
fn parse_envelope<E, T>(raw: Value, leaves: &[&str], decoded: &mut Decoded<T>) -> Option<E>
where
    E: for<'de> Deserialize<'de>,
{
    match E::deserialize(&raw) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            decoded.reject_many(records_within(&raw, leaves).max(1), e.into());
            None
        }
    }
}

fn records_within(raw: &Value, path: &[&str]) -> usize {
    match path.split_first() {
        None => 1,
        Some((key, rest)) => raw
            .get(*key)
            .and_then(Value::as_array)
            .map_or(0, |items| items.iter().map(|item| records_within(item, rest)).sum()),
    }
}

fn build_resource(resource: Option<&otlp_json::Resource>) -> (Arc<Resource>, String) {
    let attributes = resource
        .map(|r| attributes_from(&r.attributes))
        .unwrap_or_default();
    let resource = Resource { attributes };
    let service_name = resource
        .service_name()
        .filter(|s| !s.is_empty())
        .unwrap_or(UNKNOWN_SERVICE)
        .to_string();
    (Arc::new(resource), service_name)
}

// ============================================================================
// Traces
// ============================================================================

pub fn decode_traces(request: ExportTraceServiceRequest) -> Decoded<Span> {
    let mut decoded = Decoded::default();

    for raw in request.resource_spans {
        let Some(resource_spans) = parse_envelope::<otlp_json::ResourceSpans, _>(
            raw,
            &["scopeSpans", "spans"],
            &mut decoded,
        ) else {
            continue;
        };
        let (resource, service_name) = build_resource(resource_spans.resource.as_ref());

        for raw in resource_spans.scope_spans {
            let Some(scope_spans) =
                parse_envelope::<otlp_json::ScopeSpans, _>(raw, &["spans"], &mut decoded)
            else {
                continue;
            };
            let (scope_name, scope_version) = scope_spans
                .scope
                .map(|s| (s.name.unwrap_or_default(), s.version.unwrap_or_default()))
                .unwrap_or_default();

            for raw in scope_spans.spans {
                let span = serde_json::from_value::<otlp_json::Span>(raw)
                    .map_err(RecordError::from)
                    .and_then(|span| {
                        convert_span(span, &resource, &service_name, &scope_name, &scope_version)
                    });
                decoded.push(span);
            }
        }
    }

    decoded
}

fn convert_span(
    span: otlp_json::Span,
    resource: &Arc<Resource>,
    service_name: &str,
    scope_name: &str,
    scope_version: &str,
) -> Result<Span, RecordError> {
    let trace_id = normalize_id(&span.trace_id, IdKind::Trace)?;
    let span_id = normalize_id(&span.span_id, IdKind::Span)?;
    let parent_span_id = normalize_optional_id(span.parent_span_id.as_deref(), IdKind::Span)?;

    let duration = span
        .end_time_unix_nano
        .checked_sub(span.start_time_unix_nano)
        .ok_or(RecordError::TimestampOutOfRange)?;
    if duration < 0 {
        return Err(RecordError::NegativeDuration(duration));
    }

    let events = span
        .events
        .iter()
        .map(|e| SpanEvent {
            name: e.name.clone(),
            time_unix_nano: e.time_unix_nano.unwrap_or(span.start_time_unix_nano),
            attributes: attributes_from(&e.attributes),
        })
        .collect();

    // A bad link id loses the link, not the span
    let links = span
        .links
        .iter()
        .filter_map(|l| {
            let trace_id = normalize_id(&l.trace_id, IdKind::Trace).ok()?;
            let span_id = normalize_id(&l.span_id, IdKind::Span).ok()?;
            Some(SpanLink {
                trace_id,
                span_id,
                attributes: attributes_from(&l.attributes),
            })
        })
        .collect();

    let (status_code, status_message) = span
        .status
        .map(|s| {
            (
                SpanStatus::from_i32(s.code.unwrap_or(0)),
                s.message.unwrap_or_default(),
            )
        })
        .unwrap_or((SpanStatus::Unset, String::new()));

    Ok(Span {
        trace_id,
        span_id,
        parent_span_id,
        trace_state: span.trace_state.unwrap_or_default(),
        service_name: service_name.to_string(),
        operation_name: span.name,
        kind: SpanKind::from_i32(span.kind.unwrap_or(0)),
        start_time_unix_nano: span.start_time_unix_nano,
        end_time_unix_nano: span.end_time_unix_nano,
        status_code,
        status_message,
        attributes: attributes_from(&span.attributes),
        events,
        links,
        resource: Arc::clone(resource),
        scope_name: scope_name.to_string(),
        scope_version: scope_version.to_string(),
    })
}

// ============================================================================
// Logs
// ============================================================================

/// Decode logs; `now_nanos` stamps records that carry neither timestamp
pub fn decode_logs(request: ExportLogsServiceRequest, now_nanos: i64) -> Decoded<LogRecord> {
    let mut decoded = Decoded::default();

    for raw in request.resource_logs {
        let Some(resource_logs) = parse_envelope::<otlp_json::ResourceLogs, _>(
            raw,
            &["scopeLogs", "logRecords"],
            &mut decoded,
        ) else {
            continue;
        };
        let (resource, service_name) = build_resource(resource_logs.resource.as_ref());

        for raw in resource_logs.scope_logs {
            let Some(scope_logs) =
                parse_envelope::<otlp_json::ScopeLogs, _>(raw, &["logRecords"], &mut decoded)
            else {
                continue;
            };
            for raw in scope_logs.log_records {
                let record = serde_json::from_value::<otlp_json::LogRecord>(raw)
                    .map_err(RecordError::from)
                    .and_then(|record| convert_log(record, &resource, &service_name, now_nanos));
                decoded.push(record);
            }
        }
    }

    decoded
}

fn convert_log(
    record: otlp_json::LogRecord,
    resource: &Arc<Resource>,
    service_name: &str,
    now_nanos: i64,
) -> Result<LogRecord, RecordError> {
    let trace_id = normalize_optional_id(record.trace_id.as_deref(), IdKind::Trace)?;
    let span_id = normalize_optional_id(record.span_id.as_deref(), IdKind::Span)?;

    let observed = record.observed_time_unix_nano.filter(|t| *t > 0);
    let time = record
        .time_unix_nano
        .filter(|t| *t > 0)
        .or(observed)
        .unwrap_or(now_nanos);

    let severity_number = record.severity_number.unwrap_or(0);
    let severity_text = record
        .severity_text
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| severity_text_for(severity_number).to_string());

    Ok(LogRecord {
        trace_id,
        span_id,
        service_name: service_name.to_string(),
        time_unix_nano: time,
        observed_time_unix_nano: observed.unwrap_or(time),
        severity_number,
        severity_text,
        body: record
            .body
            .as_ref()
            .and_then(|b| b.to_attribute_value())
            .unwrap_or_else(|| AttributeValue::String(String::new())),
        attributes: attributes_from(&record.attributes),
        resource: Arc::clone(resource),
    })
}

// ============================================================================
// Metrics
// ============================================================================

pub fn decode_metrics(request: ExportMetricsServiceRequest) -> Decoded<MetricPoint> {
    let mut decoded = Decoded::default();

    for raw in request.resource_metrics {
        let Some(resource_metrics) = parse_envelope::<otlp_json::ResourceMetrics, _>(
            raw,
            &["scopeMetrics", "metrics"],
            &mut decoded,
        ) else {
            continue;
        };
        let (_, service_name) = build_resource(resource_metrics.resource.as_ref());

        for raw in resource_metrics.scope_metrics {
            let Some(scope_metrics) =
                parse_envelope::<otlp_json::ScopeMetrics, _>(raw, &["metrics"], &mut decoded)
            else {
                continue;
            };
            for raw in scope_metrics.metrics {
                match serde_json::from_value::<otlp_json::Metric>(raw) {
                    Ok(metric) => decode_metric(metric, &service_name, &mut decoded),
                    Err(e) => decoded.reject(e.into()),
                }
            }
        }
    }

    decoded
}

fn decode_metric(metric: otlp_json::Metric, service_name: &str, decoded: &mut Decoded<MetricPoint>) {
    let template = MetricPoint {
        service_name: service_name.to_string(),
        name: metric.name.clone(),
        description: metric.description.clone(),
        unit: metric.unit.clone(),
        metric_type: MetricType::Gauge,
        time_unix_nano: 0,
        value: 0.0,
        count: None,
        min: None,
        max: None,
        attributes: Default::default(),
    };

    let number_series = [(MetricType::Gauge, metric.gauge), (MetricType::Sum, metric.sum)];
    let distribution_series = [
        (MetricType::Histogram, metric.histogram),
        (MetricType::ExponentialHistogram, metric.exponential_histogram),
        (MetricType::Summary, metric.summary),
    ];

    let mut seen_data = false;

    for (metric_type, points) in number_series {
        let Some(points) = points else { continue };
        seen_data = true;
        for raw in points.data_points {
            let point = serde_json::from_value::<NumberDataPoint>(raw)
                .map_err(RecordError::from)
                .and_then(|p| {
                    let value = p
                        .as_double
                        .or(p.as_int.map(|i| i as f64))
                        .ok_or(RecordError::MissingValue)?;
                    Ok(MetricPoint {
                        metric_type,
                        time_unix_nano: p.time_unix_nano,
                        value,
                        attributes: attributes_from(&p.attributes),
                        ..template.clone()
                    })
                });
            decoded.push(point);
        }
    }

    for (metric_type, points) in distribution_series {
        let Some(points) = points else { continue };
        seen_data = true;
        for raw in points.data_points {
            let point = serde_json::from_value::<DistributionDataPoint>(raw)
                .map_err(RecordError::from)
                .map(|p| MetricPoint {
                    metric_type,
                    time_unix_nano: p.time_unix_nano,
                    value: p.sum.unwrap_or(0.0),
                    count: p.count.map(|c| c.max(0) as u64),
                    min: p.min,
                    max: p.max,
                    attributes: attributes_from(&p.attributes),
                    ..template.clone()
                });
            decoded.push(point);
        }
    }

    if !seen_data {
        decoded.reject(RecordError::EmptyMetric(metric.name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace_request(spans: serde_json::Value) -> ExportTraceServiceRequest {
        serde_json::from_value(serde_json::json!({
            "resourceSpans": [{
                "resource": {"attributes": [
                    {"key": "service.name", "value": {"stringValue": "frontend"}}
                ]},
                "scopeSpans": [{"scope": {"name": "lib", "version": "2"}, "spans": spans}]
            }]
        }))
        .unwrap()
    }

    #[test]
    fn test_decode_traces_base64_ids() {
        let request = trace_request(serde_json::json!([{
            "traceId": "W4qlotLIcugyHPNzCNad8g==",
            "spanId": "BRWBvzy1XBM=",
            "parentSpanId": "",
            "name": "GET /hello",
            "kind": 2,
            "startTimeUnixNano": "1000",
            "endTimeUnixNano": "3000",
            "status": {"code": 2, "message": "boom"}
        }]));

        let decoded = decode_traces(request);
        assert_eq!(decoded.rejected, 0);
        let span = &decoded.items[0];
        assert_eq!(span.trace_id, "5b8aa5a2d2c872e8321cf37308d69df2");
        assert_eq!(span.span_id, "051581bf3cb55c13");
        assert_eq!(span.parent_span_id, None);
        assert_eq!(span.service_name, "frontend");
        assert_eq!(span.kind, SpanKind::Server);
        assert_eq!(span.status_code, SpanStatus::Error);
        assert_eq!(span.status_message, "boom");
        assert_eq!(span.scope_name, "lib");
        assert_eq!(span.duration_ns(), 2000);
    }

    #[test]
    fn test_bad_spans_skipped_and_counted() {
        let request = trace_request(serde_json::json!([
            {
                "traceId": "5b8aa5a2d2c872e8321cf37308d69df2",
                "spanId": "051581bf3cb55c13",
                "name": "ok",
                "startTimeUnixNano": "1",
                "endTimeUnixNano": "2"
            },
            {
                "traceId": "short",
                "spanId": "051581bf3cb55c13",
                "name": "bad id",
                "startTimeUnixNano": "1",
                "endTimeUnixNano": "2"
            },
            {
                "traceId": "5b8aa5a2d2c872e8321cf37308d69df2",
                "spanId": "151581bf3cb55c13",
                "name": "backwards",
                "startTimeUnixNano": "5",
                "endTimeUnixNano": "2"
            },
            {"name": 42}
        ]));

        let decoded = decode_traces(request);
        assert_eq!(decoded.items.len(), 1);
        assert_eq!(decoded.rejected, 3);
        assert!(decoded.first_error.unwrap().contains("trace id"));
    }

    #[test]
    fn test_extreme_timestamps_rejected() {
        let request = trace_request(serde_json::json!([{
            "traceId": "5b8aa5a2d2c872e8321cf37308d69df2",
            "spanId": "051581bf3cb55c13",
            "name": "wraps",
            "startTimeUnixNano": "-9223372036854775808",
            "endTimeUnixNano": "1"
        }]));

        let decoded = decode_traces(request);
        assert!(decoded.items.is_empty());
        assert_eq!(decoded.rejected, 1);
        assert!(decoded.first_error.unwrap().contains("out of range"));
    }

    #[test]
    fn test_malformed_envelope_rejects_only_its_spans() {
        let span = |id: &str| {
            serde_json::json!({
                "traceId": "5b8aa5a2d2c872e8321cf37308d69df2",
                "spanId": id,
                "name": "op",
                "startTimeUnixNano": "1",
                "endTimeUnixNano": "2"
            })
        };
        let request: ExportTraceServiceRequest = serde_json::from_value(serde_json::json!({
            "resourceSpans": [
                {
                    "resource": {"attributes": [
                        {"key": "service.name", "value": {"stringValue": "ok"}},
                        {"key": "pid", "value": {"intValue": "abc"}}
                    ]},
                    "scopeSpans": [
                        {"spans": [span("051581bf3cb55c13")]},
                        {"scope": {"name": 7}, "spans": [span("151581bf3cb55c13")]}
                    ]
                },
                {
                    "resource": "not an object",
                    "scopeSpans": [{"spans": [span("251581bf3cb55c13"), span("351581bf3cb55c13")]}]
                },
                null
            ]
        }))
        .unwrap();

        let decoded = decode_traces(request);
        assert_eq!(decoded.items.len(), 1);
        assert_eq!(decoded.items[0].service_name, "ok");
        assert!(!decoded.items[0].resource.attributes.contains_key("pid"));
        // bad scope (1) + bad resource (2) + null envelope (1)
        assert_eq!(decoded.rejected, 4);
    }

    #[test]
    fn test_missing_service_name_defaults() {
        let request: ExportTraceServiceRequest = serde_json::from_value(serde_json::json!({
            "resourceSpans": [{
                "scopeSpans": [{"spans": [{
                    "traceId": "5b8aa5a2d2c872e8321cf37308d69df2",
                    "spanId": "051581bf3cb55c13",
                    "name": "op",
                    "startTimeUnixNano": "1",
                    "endTimeUnixNano": "2"
                }]}]
            }]
        }))
        .unwrap();

        let decoded = decode_traces(request);
        assert_eq!(decoded.items[0].service_name, UNKNOWN_SERVICE);
    }

    #[test]
    fn test_decode_logs() {
        let request: ExportLogsServiceRequest = serde_json::from_value(serde_json::json!({
            "resourceLogs": [{
                "resource": {"attributes": [
                    {"key": "service.name", "value": {"stringValue": "backend"}}
                ]},
                "scopeLogs": [{"logRecords": [
                    {
                        "timeUnixNano": "1700000000000000000",
                        "severityNumber": 17,
                        "body": {"stringValue": "failed to compute"},
                        "traceId": "W4qlotLIcugyHPNzCNad8g==",
                        "spanId": "BRWBvzy1XBM="
                    },
                    {
                        "observedTimeUnixNano": "1700000000000000005",
                        "severityText": "info",
                        "body": {"stringValue": "no timestamp"}
                    },
                    {"traceId": "!!", "body": {"stringValue": "bad"}}
                ]}]
            }]
        }))
        .unwrap();

        let decoded = decode_logs(request, 99);
        assert_eq!(decoded.items.len(), 2);
        assert_eq!(decoded.rejected, 1);

        let first = &decoded.items[0];
        assert_eq!(first.severity_text, "ERROR");
        assert_eq!(
            first.trace_id.as_deref(),
            Some("5b8aa5a2d2c872e8321cf37308d69df2")
        );
        assert_eq!(first.service_name, "backend");

        let second = &decoded.items[1];
        assert_eq!(second.time_unix_nano, 1_700_000_000_000_000_005);
        assert_eq!(second.severity_text, "info");
        assert_eq!(second.trace_id, None);
    }

    #[test]
    fn test_decode_metrics() {
        let request: ExportMetricsServiceRequest = serde_json::from_value(serde_json::json!({
            "resourceMetrics": [{
                "resource": {"attributes": [
                    {"key": "service.name", "value": {"stringValue": "api"}}
                ]},
                "scopeMetrics": [{"metrics": [
                    {
                        "name": "http.server.requests",
                        "unit": "1",
                        "sum": {"dataPoints": [
                            {"timeUnixNano": "10", "asInt": "5",
                             "attributes": [{"key": "route", "value": {"stringValue": "/a"}}]},
                            {"timeUnixNano": "10"}
                        ], "isMonotonic": true}
                    },
                    {
                        "name": "http.server.duration",
                        "histogram": {"dataPoints": [
                            {"timeUnixNano": "10", "count": "4", "sum": 12.5, "min": 1.0, "max": 6.0}
                        ]}
                    },
                    {"name": "nothing"}
                ]}]
            }]
        }))
        .unwrap();

        let decoded = decode_metrics(request);
        assert_eq!(decoded.items.len(), 2);
        // missing value + metric without data
        assert_eq!(decoded.rejected, 2);

        let sum = &decoded.items[0];
        assert_eq!(sum.metric_type, MetricType::Sum);
        assert_eq!(sum.value, 5.0);
        assert_eq!(sum.service_name, "api");

        let histogram = &decoded.items[1];
        assert_eq!(histogram.metric_type, MetricType::Histogram);
        assert_eq!(histogram.value, 12.5);
        assert_eq!(histogram.count, Some(4));
    }
}
