//! Telemetry data model stored and served by ollyscale

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Attribute bags keep a stable key order so hashing and rendering are deterministic
pub type Attributes = BTreeMap<String, AttributeValue>;

/// Span kind from OTel spec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum SpanKind {
    Unspecified = 0,
    Internal = 1,
    Server = 2,
    Client = 3,
    Producer = 4,
    Consumer = 5,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::Unspecified => "UNSPECIFIED",
            SpanKind::Internal => "INTERNAL",
            SpanKind::Server => "SERVER",
            SpanKind::Client => "CLIENT",
            SpanKind::Producer => "PRODUCER",
            SpanKind::Consumer => "CONSUMER",
        }
    }

    pub fn from_i32(v: i32) -> Self {
        match v {
            1 => SpanKind::Internal,
            2 => SpanKind::Server,
            3 => SpanKind::Client,
            4 => SpanKind::Producer,
            5 => SpanKind::Consumer,
            _ => SpanKind::Unspecified,
        }
    }
}

/// Span status from OTel spec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum SpanStatus {
    Unset = 0,
    Ok = 1,
    Error = 2,
}

impl SpanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanStatus::Unset => "UNSET",
            SpanStatus::Ok => "OK",
            SpanStatus::Error => "ERROR",
        }
    }

    pub fn from_i32(v: i32) -> Self {
        match v {
            1 => SpanStatus::Ok,
            2 => SpanStatus::Error,
            _ => SpanStatus::Unset,
        }
    }
}

/// Attribute value types
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    #[serde(serialize_with = "serialize_bytes_hex")]
    Bytes(Vec<u8>),
    Array(Vec<AttributeValue>),
    Map(Attributes),
}

#[allow(clippy::ptr_arg)]
fn serialize_bytes_hex<S: Serializer>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes))
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Int(i) => Some(*i as f64),
            AttributeValue::Float(f) => Some(*f),
            AttributeValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Feed the value into a hasher; floats hash by bit pattern
    pub fn hash_into<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            AttributeValue::String(s) => s.hash(state),
            AttributeValue::Int(i) => i.hash(state),
            AttributeValue::Float(f) => f.to_bits().hash(state),
            AttributeValue::Bool(b) => b.hash(state),
            AttributeValue::Bytes(b) => b.hash(state),
            AttributeValue::Array(values) => {
                values.len().hash(state);
                for v in values {
                    v.hash_into(state);
                }
            }
            AttributeValue::Map(map) => hash_attributes(map, state),
        }
    }
}

impl std::fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttributeValue::String(s) => write!(f, "{}", s),
            AttributeValue::Int(i) => write!(f, "{}", i),
            AttributeValue::Float(v) => write!(f, "{}", v),
            AttributeValue::Bool(b) => write!(f, "{}", b),
            AttributeValue::Bytes(b) => write!(f, "{}", hex::encode(b)),
            AttributeValue::Array(_) | AttributeValue::Map(_) => {
                let json = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
                write!(f, "{}", json)
            }
        }
    }
}

/// Hash an attribute bag in key order
pub fn hash_attributes<H: Hasher>(attributes: &Attributes, state: &mut H) {
    attributes.len().hash(state);
    for (key, value) in attributes {
        key.hash(state);
        value.hash_into(state);
    }
}

/// Resource dimension shared by every record of one OTLP resource block
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Resource {
    pub attributes: Attributes,
}

impl Resource {
    pub fn service_name(&self) -> Option<&str> {
        self.attributes.get("service.name").and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanEvent {
    pub name: String,
    pub time_unix_nano: i64,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanLink {
    pub trace_id: String,
    pub span_id: String,
    pub attributes: Attributes,
}

/// A span as stored; identifiers are canonical lowercase hex
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Span {
    /// 32 hex character trace ID
    pub trace_id: String,
    /// 16 hex character span ID, unique within its trace
    pub span_id: String,
    /// Parent span ID, `None` for roots
    pub parent_span_id: Option<String>,
    /// Trace state (W3C format)
    pub trace_state: String,
    pub service_name: String,
    pub operation_name: String,
    pub kind: SpanKind,
    pub start_time_unix_nano: i64,
    pub end_time_unix_nano: i64,
    pub status_code: SpanStatus,
    pub status_message: String,
    pub attributes: Attributes,
    pub events: Vec<SpanEvent>,
    pub links: Vec<SpanLink>,
    pub resource: Arc<Resource>,
    pub scope_name: String,
    pub scope_version: String,
}

impl Span {
    pub fn duration_ns(&self) -> i64 {
        self.end_time_unix_nano.saturating_sub(self.start_time_unix_nano)
    }

    pub fn duration_ms(&self) -> f64 {
        self.duration_ns() as f64 / 1_000_000.0
    }

    pub fn is_error(&self) -> bool {
        self.status_code == SpanStatus::Error
    }

    /// Look up an attribute on the span, falling back to its resource
    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes
            .get(key)
            .or_else(|| self.resource.attributes.get(key))
    }

    /// HTTP method under either the legacy or the stable semantic convention key
    pub fn http_method(&self) -> Option<&str> {
        self.attributes
            .get("http.method")
            .or_else(|| self.attributes.get("http.request.method"))
            .and_then(|v| v.as_str())
    }

    pub fn http_route(&self) -> Option<&str> {
        self.attributes.get("http.route").and_then(|v| v.as_str())
    }
}

/// Map an OTLP severity number onto its short text
pub fn severity_text_for(number: i32) -> &'static str {
    match number {
        1..=4 => "TRACE",
        5..=8 => "DEBUG",
        9..=12 => "INFO",
        13..=16 => "WARN",
        17..=20 => "ERROR",
        21..=24 => "FATAL",
        _ => "UNSPECIFIED",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub service_name: String,
    pub time_unix_nano: i64,
    pub observed_time_unix_nano: i64,
    pub severity_number: i32,
    pub severity_text: String,
    pub body: AttributeValue,
    pub attributes: Attributes,
    pub resource: Arc<Resource>,
}

impl LogRecord {
    /// Identity used to make repeated ingestion of the same record a no-op
    pub fn identity_hash(&self) -> u64 {
        let mut hasher = fxhash::FxHasher64::default();
        self.trace_id.hash(&mut hasher);
        self.span_id.hash(&mut hasher);
        self.service_name.hash(&mut hasher);
        self.time_unix_nano.hash(&mut hasher);
        self.severity_number.hash(&mut hasher);
        self.severity_text.hash(&mut hasher);
        self.body.hash_into(&mut hasher);
        hash_attributes(&self.attributes, &mut hasher);
        hasher.finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Gauge,
    Sum,
    Histogram,
    ExponentialHistogram,
    Summary,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Gauge => "gauge",
            MetricType::Sum => "sum",
            MetricType::Histogram => "histogram",
            MetricType::ExponentialHistogram => "exponential_histogram",
            MetricType::Summary => "summary",
        }
    }
}

/// One data point of one metric series
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricPoint {
    pub service_name: String,
    pub name: String,
    pub description: String,
    pub unit: String,
    pub metric_type: MetricType,
    pub time_unix_nano: i64,
    /// Point value; the sum for histogram and summary points
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    pub attributes: Attributes,
}

impl MetricPoint {
    /// Series identity: metric name plus label set (service name included)
    pub fn series_hash(&self) -> u64 {
        let mut hasher = fxhash::FxHasher64::default();
        self.name.hash(&mut hasher);
        self.service_name.hash(&mut hasher);
        hash_attributes(&self.attributes, &mut hasher);
        hasher.finish()
    }
}
