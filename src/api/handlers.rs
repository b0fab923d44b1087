use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::flows::{build_flows, flow_detail, LintCache, LintCacheStats, LintConfig, TraceFlow};
use crate::otel::{
    validate_hex_id, IdError, IdKind, IngestCounters, IngestStats, LogRecord, MetricPoint,
};
use crate::platform::is_visible;
use crate::query::{
    PageInfo, QueryError, RedMetrics, SearchRequest, ServiceMap, ServiceSummary, SpanTree,
    TimeRange, TraceDetail, TraceSummary,
};
use crate::storage::{MetricSummary, StorageError, StoreStats, TelemetryStore};

/// Application state shared across handlers
pub struct AppState {
    pub store: Arc<dyn TelemetryStore>,
    pub counters: IngestCounters,
    pub lint_cache: LintCache,
}

impl AppState {
    pub fn new(store: Arc<dyn TelemetryStore>) -> Self {
        Self::with_lint_config(store, LintConfig::default())
    }

    pub fn with_lint_config(store: Arc<dyn TelemetryStore>, lint: LintConfig) -> Self {
        let retention = Duration::from_nanos(u64::try_from(store.ttl_nanos()).unwrap_or(0));
        Self {
            lint_cache: LintCache::new(lint, retention),
            store,
            counters: IngestCounters::new(),
        }
    }

    /// Default search window: one retention period ending now
    fn default_range(&self) -> TimeRange {
        TimeRange::last(self.store.ttl_nanos(), self.store.now())
    }
}

/// Parse an optional JSON body; an empty body means "all defaults"
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid request body: {}", e)))
}

// ============================================================================
// Health Check
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============================================================================
// Stats
// ============================================================================

#[derive(Serialize)]
pub struct StatsResponse {
    pub store: StoreStats,
    pub ingest: IngestStats,
    pub lint_cache: LintCacheStats,
}

pub async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        store: state.store.stats(),
        ingest: state.counters.snapshot(),
        lint_cache: state.lint_cache.stats(),
    })
}

// ============================================================================
// Traces
// ============================================================================

#[derive(Serialize)]
pub struct TraceSearchResponse {
    pub traces: Vec<TraceSummary>,
    pub pagination: PageInfo,
}

pub async fn search_traces(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<TraceSearchResponse>, ApiError> {
    let request: SearchRequest = parse_body(&body)?;
    let query = request.compile(state.store.now(), state.store.ttl_nanos())?;
    let page = state.store.search_traces(&query)?;

    tracing::debug!(
        "Trace search returned {} traces (more: {})",
        page.items.len(),
        page.next_cursor.is_some()
    );

    Ok(Json(TraceSearchResponse {
        pagination: PageInfo::new(page.next_cursor.as_ref(), query.limit),
        traces: page.items.iter().map(TraceSummary::from_tree).collect(),
    }))
}

pub async fn get_trace(
    State(state): State<Arc<AppState>>,
    Path(trace_id): Path<String>,
) -> Result<Response, ApiError> {
    validate_hex_id(&trace_id, IdKind::Trace)?;
    let tree = state.store.get_trace(&trace_id)?;
    Ok(Json(TraceDetail::from_tree(&tree)).into_response())
}

// ============================================================================
// Logs and Metrics
// ============================================================================

#[derive(Serialize)]
pub struct LogSearchResponse {
    pub logs: Vec<LogRecord>,
    pub pagination: PageInfo,
}

pub async fn search_logs(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<LogSearchResponse>, ApiError> {
    let request: SearchRequest = parse_body(&body)?;
    let query = request.compile(state.store.now(), state.store.ttl_nanos())?;
    let page = state.store.search_logs(&query)?;

    Ok(Json(LogSearchResponse {
        pagination: PageInfo::new(page.next_cursor.as_ref(), query.limit),
        logs: page.items,
    }))
}

#[derive(Serialize)]
pub struct MetricSearchResponse {
    pub metrics: Vec<MetricPoint>,
    pub pagination: PageInfo,
}

pub async fn search_metrics(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<MetricSearchResponse>, ApiError> {
    let request: SearchRequest = parse_body(&body)?;
    let query = request.compile(state.store.now(), state.store.ttl_nanos())?;
    let page = state.store.search_metrics(&query)?;

    Ok(Json(MetricSearchResponse {
        pagination: PageInfo::new(page.next_cursor.as_ref(), query.limit),
        metrics: page.items,
    }))
}

#[derive(Serialize)]
pub struct MetricCatalogResponse {
    pub metrics: Vec<MetricSummary>,
}

pub async fn metric_catalog(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WindowParams>,
) -> Result<Json<MetricCatalogResponse>, ApiError> {
    Ok(Json(MetricCatalogResponse {
        metrics: state.store.metric_catalog(params.include_platform)?,
    }))
}

// ============================================================================
// Derived views: services, service map, flows
// ============================================================================

/// Query string accepted by the derived views
#[derive(Debug, Default, Deserialize)]
pub struct WindowParams {
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    #[serde(default)]
    pub include_platform: bool,
}

impl WindowParams {
    fn range(&self, state: &AppState) -> Result<TimeRange, ApiError> {
        let end = self.end_time.unwrap_or_else(|| state.store.now());
        let start = self
            .start_time
            .unwrap_or_else(|| end.saturating_sub(state.store.ttl_nanos()));
        checked_range(TimeRange::new(start, end))
    }
}

fn checked_range(range: TimeRange) -> Result<TimeRange, ApiError> {
    if range.start_time > range.end_time {
        return Err(QueryError::InvertedTimeRange {
            start: range.start_time,
            end: range.end_time,
        }
        .into());
    }
    Ok(range)
}

/// JSON body of `POST /api/service-map`
#[derive(Debug, Default, Deserialize)]
pub struct ServiceMapRequest {
    #[serde(default)]
    pub time_range: Option<TimeRange>,
    #[serde(default)]
    pub include_platform: bool,
}

pub async fn service_map(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WindowParams>,
) -> Result<Json<ServiceMap>, ApiError> {
    let range = params.range(&state)?;
    Ok(Json(state.store.service_map(&range, params.include_platform)?))
}

pub async fn service_map_search(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<ServiceMap>, ApiError> {
    let request: ServiceMapRequest = parse_body(&body)?;
    let range = checked_range(request.time_range.unwrap_or_else(|| state.default_range()))?;
    Ok(Json(state.store.service_map(&range, request.include_platform)?))
}

#[derive(Serialize)]
pub struct ServicesResponse {
    pub services: Vec<ServiceSummary>,
    pub time_range: TimeRange,
}

pub async fn list_services(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WindowParams>,
) -> Result<Json<ServicesResponse>, ApiError> {
    let range = params.range(&state)?;
    Ok(Json(ServicesResponse {
        services: state.store.service_catalog(&range, params.include_platform)?,
        time_range: range,
    }))
}

pub async fn service_metrics(
    State(state): State<Arc<AppState>>,
    Path(service): Path<String>,
    Query(params): Query<WindowParams>,
) -> Result<Json<RedMetrics>, ApiError> {
    let range = params.range(&state)?;
    let metrics = state.store.service_red_metrics(&service, &range)?;
    if metrics.request_count == 0 {
        return Err(ApiError::NotFound(format!(
            "No spans for service '{}' in range",
            service
        )));
    }
    Ok(Json(metrics))
}

#[derive(Serialize)]
pub struct FlowsResponse {
    pub flows: Vec<TraceFlow>,
    pub time_range: TimeRange,
}

/// Traces in range whose root service is visible
fn visible_traces(
    state: &AppState,
    params: &WindowParams,
) -> Result<(Vec<SpanTree>, TimeRange), ApiError> {
    let range = params.range(state)?;
    let mut trees = state.store.traces_in_range(&range)?;
    trees.retain(|tree| {
        tree.root()
            .map_or(false, |root| is_visible(&root.service_name, params.include_platform))
    });
    Ok((trees, range))
}

pub async fn list_flows(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WindowParams>,
) -> Result<Json<FlowsResponse>, ApiError> {
    let (trees, range) = visible_traces(&state, &params)?;
    let flows = build_flows(&trees, &state.lint_cache);
    tracing::debug!("Built {} flows from {} traces", flows.len(), trees.len());
    Ok(Json(FlowsResponse {
        flows,
        time_range: range,
    }))
}

pub async fn get_flow(
    State(state): State<Arc<AppState>>,
    Path(flow_hash): Path<String>,
    Query(params): Query<WindowParams>,
) -> Result<Response, ApiError> {
    let (trees, _) = visible_traces(&state, &params)?;
    let detail = flow_detail(&trees, &flow_hash, &state.lint_cache)
        .ok_or_else(|| ApiError::NotFound(format!("Flow '{}' not found", flow_hash)))?;
    Ok(Json(detail).into_response())
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    MalformedPayload(String),
    NotFound(String),
    StorageUnavailable(String),
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unavailable(_) => ApiError::StorageUnavailable(err.to_string()),
            StorageError::NotFound { .. } => ApiError::NotFound(err.to_string()),
        }
    }
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<IdError> for ApiError {
    fn from(err: IdError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::MalformedPayload(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::StorageUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };

        let body = serde_json::json!({
            "error": message,
        });

        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}
