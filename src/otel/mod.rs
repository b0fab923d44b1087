//! OpenTelemetry ingest for ollyscale
//!
//! Accepts OTLP/HTTP JSON for all three signals:
//! ```bash
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://localhost:5002
//! OTEL_EXPORTER_OTLP_PROTOCOL=http/json
//! ```
//!
//! Or forward from an OTel Collector:
//! ```yaml
//! exporters:
//!   otlphttp:
//!     endpoint: http://ollyscale:5002
//!     encoding: json
//! ```
//!
//! Identifiers arrive base64 encoded and are stored as lowercase hex.

pub mod convert;
pub mod counters;
pub mod ids;
pub mod ingest;
pub mod model;
pub mod otlp_json;

pub use convert::{decode_logs, decode_metrics, decode_traces, Decoded, RecordError, UNKNOWN_SERVICE};
pub use counters::{IngestCounters, IngestStats, Signal, SignalStats};
pub use ids::{decode_id, encode_id, normalize_id, validate_hex_id, IdError, IdKind};
pub use ingest::{handle_otlp_logs, handle_otlp_metrics, handle_otlp_traces};
pub use model::{
    AttributeValue, Attributes, LogRecord, MetricPoint, MetricType, Resource, Span, SpanEvent,
    SpanKind, SpanLink, SpanStatus,
};
