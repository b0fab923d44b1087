//! OTLP/HTTP JSON ingest handlers
//!
//! Endpoints: `POST /v1/traces`, `POST /v1/logs`, `POST /v1/metrics`.
//!
//! Ingestion is best effort. Records that cannot be decoded are skipped and
//! reported through OTLP `partialSuccess` with a 200 response; only a body
//! that is not JSON at all is refused with 400. A store that cannot take the
//! batch answers 503 so the exporter retries.

use axum::{body::Bytes, extract::State, Json};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

use super::convert::{decode_logs, decode_metrics, decode_traces};
use super::counters::Signal;
use super::otlp_json::{
    ExportLogsServiceRequest, ExportMetricsServiceRequest, ExportTraceServiceRequest,
};
use crate::api::handlers::{ApiError, AppState};
use crate::storage::StorageError;

fn parse_payload<T: DeserializeOwned>(
    state: &AppState,
    signal: Signal,
    body: &Bytes,
) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| {
        state.counters.record_malformed();
        tracing::warn!(signal = signal.as_str(), "Rejecting malformed OTLP payload: {}", e);
        ApiError::MalformedPayload(format!("Invalid OTLP JSON for {}: {}", signal.as_str(), e))
    })
}

fn storage_failure(state: &AppState, signal: Signal, err: StorageError) -> ApiError {
    state.counters.record_storage_error();
    tracing::warn!(signal = signal.as_str(), "Failed to store batch: {}", err);
    ApiError::from(err)
}

/// OTLP export response body
fn export_response(rejected_field: &str, rejected: usize, message: Option<String>) -> Json<Value> {
    if rejected == 0 && message.is_none() {
        return Json(json!({ "partialSuccess": null }));
    }
    Json(json!({
        "partialSuccess": {
            rejected_field: rejected,
            "errorMessage": message.unwrap_or_default(),
        }
    }))
}

/// Handle OTLP/HTTP trace export
///
/// Endpoint: POST /v1/traces
pub async fn handle_otlp_traces(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    state.counters.record_request(Signal::Traces);
    let request: ExportTraceServiceRequest = parse_payload(&state, Signal::Traces, &body)?;

    let decoded = decode_traces(request);
    let trace_ids: HashSet<String> = decoded.items.iter().map(|s| s.trace_id.clone()).collect();

    let summary = state
        .store
        .put_spans(decoded.items)
        .map_err(|e| storage_failure(&state, Signal::Traces, e))?;

    // Cached findings for these traces no longer describe all their spans
    state
        .lint_cache
        .invalidate_many(trace_ids.iter().map(String::as_str));

    state.counters.record_batch(
        Signal::Traces,
        summary.accepted,
        decoded.rejected,
        summary.duplicates,
    );
    if decoded.rejected > 0 {
        tracing::warn!(
            "OTLP trace export had {} rejected spans out of {}",
            decoded.rejected,
            decoded.rejected + summary.accepted + summary.duplicates
        );
    }

    Ok(export_response(
        "rejectedSpans",
        decoded.rejected,
        decoded.first_error,
    ))
}

/// Handle OTLP/HTTP log export
///
/// Endpoint: POST /v1/logs
pub async fn handle_otlp_logs(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    state.counters.record_request(Signal::Logs);
    let request: ExportLogsServiceRequest = parse_payload(&state, Signal::Logs, &body)?;

    let decoded = decode_logs(request, state.store.now());
    let summary = state
        .store
        .put_logs(decoded.items)
        .map_err(|e| storage_failure(&state, Signal::Logs, e))?;

    state.counters.record_batch(
        Signal::Logs,
        summary.accepted,
        decoded.rejected,
        summary.duplicates,
    );
    if decoded.rejected > 0 {
        tracing::warn!("OTLP log export had {} rejected records", decoded.rejected);
    }

    Ok(export_response(
        "rejectedLogRecords",
        decoded.rejected,
        decoded.first_error,
    ))
}

/// Handle OTLP/HTTP metric export
///
/// Endpoint: POST /v1/metrics
pub async fn handle_otlp_metrics(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    state.counters.record_request(Signal::Metrics);
    let request: ExportMetricsServiceRequest = parse_payload(&state, Signal::Metrics, &body)?;

    let decoded = decode_metrics(request);
    let summary = state
        .store
        .put_metrics(decoded.items)
        .map_err(|e| storage_failure(&state, Signal::Metrics, e))?;

    state.counters.record_batch(
        Signal::Metrics,
        summary.accepted,
        decoded.rejected,
        summary.duplicates,
    );
    state.counters.record_overflow(summary.overflowed);

    // Overflowed points are stored, so they are reported but not rejected
    let message = match (decoded.first_error, summary.overflowed) {
        (message, 0) => message,
        (None, n) => Some(cardinality_message(n)),
        (Some(message), n) => Some(format!("{}; {}", message, cardinality_message(n))),
    };

    Ok(export_response("rejectedDataPoints", decoded.rejected, message))
}

fn cardinality_message(points: usize) -> String {
    format!(
        "cardinality exceeded: {} data points redirected to the overflow series",
        points
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, StoreConfig, TelemetryStore};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use tower::util::ServiceExt;

    fn app(config: StoreConfig) -> (Router, Arc<AppState>) {
        let state = Arc::new(AppState::new(Arc::new(MemoryStore::new(config))));
        let router = Router::new()
            .route("/v1/traces", post(handle_otlp_traces))
            .route("/v1/logs", post(handle_otlp_logs))
            .route("/v1/metrics", post(handle_otlp_metrics))
            .with_state(state.clone());
        (router, state)
    }

    async fn post_json(app: Router, uri: &str, body: String) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn traces_body(spans: Value) -> String {
        json!({
            "resourceSpans": [{
                "resource": {"attributes": [
                    {"key": "service.name", "value": {"stringValue": "checkout"}}
                ]},
                "scopeSpans": [{"spans": spans}]
            }]
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_partial_success_for_bad_span() {
        let (app, state) = app(StoreConfig::default());
        let body = traces_body(json!([
            {
                "traceId": "W4qlotLIcugyHPNzCNad8g==",
                "spanId": "BRWBvzy1XBM=",
                "name": "GET /cart",
                "kind": 2,
                "startTimeUnixNano": "1000",
                "endTimeUnixNano": "2000"
            },
            {
                "traceId": "not-an-id",
                "spanId": "BRWBvzy1XBM=",
                "name": "broken",
                "startTimeUnixNano": "1000",
                "endTimeUnixNano": "2000"
            }
        ]));

        let (status, json) = post_json(app, "/v1/traces", body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["partialSuccess"]["rejectedSpans"], 1);
        assert!(json["partialSuccess"]["errorMessage"]
            .as_str()
            .unwrap()
            .contains("trace"));

        let tree = state
            .store
            .get_trace("5b8aa5a2d2c872e8321cf37308d69df2")
            .unwrap();
        assert_eq!(tree.span(0).service_name, "checkout");
        assert_eq!(tree.span(0).span_id, "051581bf3cb55c13");

        let stats = state.counters.snapshot();
        assert_eq!(stats.traces.accepted, 1);
        assert_eq!(stats.traces.rejected, 1);
    }

    #[tokio::test]
    async fn test_bad_resource_attribute_keeps_batch() {
        let (app, state) = app(StoreConfig::default());
        let body = json!({
            "resourceSpans": [
                {
                    "resource": {"attributes": [
                        {"key": "service.name", "value": {"stringValue": "ok"}},
                        {"key": "process.pid", "value": {"intValue": "abc"}}
                    ]},
                    "scopeSpans": [{"spans": [{
                        "traceId": "5b8aa5a2d2c872e8321cf37308d69df2",
                        "spanId": "051581bf3cb55c13",
                        "name": "GET /cart",
                        "startTimeUnixNano": "1000",
                        "endTimeUnixNano": "2000"
                    }]}]
                },
                {"resource": 42, "scopeSpans": [{"spans": [{"name": "lost"}]}]},
                null
            ]
        })
        .to_string();

        let (status, json) = post_json(app, "/v1/traces", body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["partialSuccess"]["rejectedSpans"], 2);

        let tree = state
            .store
            .get_trace("5b8aa5a2d2c872e8321cf37308d69df2")
            .unwrap();
        assert_eq!(tree.span(0).service_name, "ok");
        assert_eq!(state.counters.snapshot().malformed_payloads, 0);
    }

    #[tokio::test]
    async fn test_malformed_payload() {
        let (app, state) = app(StoreConfig::default());
        let (status, json) = post_json(app, "/v1/traces", "{not json".to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("Invalid OTLP JSON"));
        assert_eq!(state.counters.snapshot().malformed_payloads, 1);
        assert_eq!(state.store.stats().spans, 0);
    }

    #[tokio::test]
    async fn test_storage_unavailable() {
        let (app, state) = app(StoreConfig::default().with_max_bytes(16));
        let body = traces_body(json!([{
            "traceId": "5b8aa5a2d2c872e8321cf37308d69df2",
            "spanId": "051581bf3cb55c13",
            "name": "GET /cart",
            "startTimeUnixNano": "1000",
            "endTimeUnixNano": "2000"
        }]));
        let (status, _) = post_json(app, "/v1/traces", body).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.counters.snapshot().storage_errors, 1);
    }

    #[tokio::test]
    async fn test_logs_ingest() {
        let (app, state) = app(StoreConfig::default());
        let body = json!({
            "resourceLogs": [{
                "resource": {"attributes": [
                    {"key": "service.name", "value": {"stringValue": "checkout"}}
                ]},
                "scopeLogs": [{"logRecords": [{
                    "timeUnixNano": "1000",
                    "severityNumber": 17,
                    "body": {"stringValue": "payment failed"},
                    "traceId": "5b8aa5a2d2c872e8321cf37308d69df2"
                }]}]
            }]
        })
        .to_string();

        let (status, json) = post_json(app, "/v1/logs", body).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["partialSuccess"].is_null());
        assert_eq!(state.store.stats().logs, 1);
    }

    #[tokio::test]
    async fn test_metrics_overflow_reported() {
        let (app, state) = app(StoreConfig::default().with_max_series_per_metric(1));
        let point = |route: &str| {
            json!({
                "timeUnixNano": "1000",
                "asInt": "1",
                "attributes": [{"key": "route", "value": {"stringValue": route}}]
            })
        };
        let body = json!({
            "resourceMetrics": [{
                "resource": {"attributes": [
                    {"key": "service.name", "value": {"stringValue": "checkout"}}
                ]},
                "scopeMetrics": [{"metrics": [{
                    "name": "http.requests",
                    "sum": {"dataPoints": [point("/a"), point("/b")]}
                }]}]
            }]
        })
        .to_string();

        let (status, json) = post_json(app, "/v1/metrics", body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["partialSuccess"]["rejectedDataPoints"], 0);
        assert!(json["partialSuccess"]["errorMessage"]
            .as_str()
            .unwrap()
            .contains("cardinality exceeded"));
        assert_eq!(state.store.stats().metric_points, 2);
        assert_eq!(state.counters.snapshot().overflowed_points, 1);
    }
}
