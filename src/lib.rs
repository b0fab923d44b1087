//! ollyscale: OpenTelemetry-native observability backend
//!
//! Receives traces, logs and metrics over OTLP/HTTP JSON, keeps them in a
//! bounded in-memory store with TTL expiration, and serves search, service
//! map, RED metrics and trace-flow lint views over a JSON API.
//!
//! # Features
//!
//! - **OTLP Ingest**: `/v1/traces`, `/v1/logs`, `/v1/metrics` with partial success
//! - **Bounded Storage**: memory budget, per-metric cardinality limits, TTL sweeps
//! - **Search**: filters, time ranges and stable cursor pagination
//! - **Service Map**: cross-service call edges with p95 latency
//! - **Trace Flows**: traces grouped by shape and linted for common instrumentation mistakes
//!
//! # Example
//!
//! ```no_run
//! use ollyscale::storage::{MemoryStore, StoreConfig, TelemetryStore};
//! use ollyscale::query::TimeRange;
//!
//! let store = MemoryStore::new(StoreConfig::default());
//! let range = TimeRange::last(store.ttl_nanos(), store.now());
//! let map = store.service_map(&range, false).unwrap();
//! println!("{} services", map.nodes.len());
//! ```

pub mod api;
pub mod compaction;
pub mod flows;
pub mod otel;
pub mod platform;
pub mod query;
pub mod storage;

// Re-export commonly used types
pub use api::{build_router, run_server, ServerConfig};
pub use query::{QueryError, SearchQuery, SearchRequest, SpanTree, TimeRange};
pub use storage::{MemoryStore, StorageError, StoreConfig, TelemetryStore};
