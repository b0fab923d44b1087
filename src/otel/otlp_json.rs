//! OTLP JSON format structures (for HTTP/JSON ingest)
//!
//! Every list in an export request (resource envelopes, scope envelopes and
//! leaf records) is kept as raw JSON values at this layer, so one malformed
//! entry can be skipped and counted without failing the whole request.
//! Attribute lists drop entries that do not parse.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use super::model::{AttributeValue, Attributes};

/// OTLP encodes 64-bit integers as JSON strings; some SDKs send plain numbers
#[derive(Deserialize)]
#[serde(untagged)]
enum IntOrString {
    Int(i64),
    UInt(u64),
    String(String),
}

impl IntOrString {
    fn into_i64<E: serde::de::Error>(self) -> Result<i64, E> {
        match self {
            IntOrString::Int(i) => Ok(i),
            IntOrString::UInt(u) => i64::try_from(u).map_err(E::custom),
            IntOrString::String(s) => s.trim().parse().map_err(E::custom),
        }
    }
}

pub fn de_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    IntOrString::deserialize(deserializer)?.into_i64()
}

pub fn de_opt_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    Option::<IntOrString>::deserialize(deserializer)?
        .map(IntOrString::into_i64)
        .transpose()
}

/// A JSON list as raw values; null or missing is empty, a non-list is one bad entry
pub fn de_value_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Value>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items,
        Some(other) => vec![other],
    })
}

/// A JSON list keeping only the entries that parse as `T`
pub fn de_lenient_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let items = match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Array(items)) => items,
        _ => return Ok(Vec::new()),
    };
    Ok(items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::debug!("Dropping unparsable OTLP list entry: {}", e);
                None
            }
        })
        .collect())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    #[serde(default, deserialize_with = "de_lenient_list")]
    pub attributes: Vec<KeyValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentationScope {
    pub name: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyValue {
    pub key: String,
    pub value: Option<AnyValue>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnyValue {
    pub string_value: Option<String>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub int_value: Option<i64>,
    pub double_value: Option<f64>,
    pub bool_value: Option<bool>,
    pub bytes_value: Option<String>,
    pub array_value: Option<ArrayValue>,
    pub kvlist_value: Option<KeyValueList>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ArrayValue {
    #[serde(default, deserialize_with = "de_lenient_list")]
    pub values: Vec<AnyValue>,
}

#[derive(Debug, Default, Deserialize)]
pub struct KeyValueList {
    #[serde(default, deserialize_with = "de_lenient_list")]
    pub values: Vec<KeyValue>,
}

impl AnyValue {
    pub fn to_attribute_value(&self) -> Option<AttributeValue> {
        if let Some(s) = &self.string_value {
            return Some(AttributeValue::String(s.clone()));
        }
        if let Some(i) = self.int_value {
            return Some(AttributeValue::Int(i));
        }
        if let Some(d) = self.double_value {
            return Some(AttributeValue::Float(d));
        }
        if let Some(b) = self.bool_value {
            return Some(AttributeValue::Bool(b));
        }
        if let Some(b64) = &self.bytes_value {
            return STANDARD.decode(b64).ok().map(AttributeValue::Bytes);
        }
        if let Some(array) = &self.array_value {
            return Some(AttributeValue::Array(
                array
                    .values
                    .iter()
                    .filter_map(AnyValue::to_attribute_value)
                    .collect(),
            ));
        }
        if let Some(kvlist) = &self.kvlist_value {
            return Some(AttributeValue::Map(attributes_from(&kvlist.values)));
        }
        None
    }
}

/// Collect key/values into an attribute bag, dropping empty values
pub fn attributes_from(kvs: &[KeyValue]) -> Attributes {
    kvs.iter()
        .filter_map(|kv| {
            kv.value
                .as_ref()
                .and_then(AnyValue::to_attribute_value)
                .map(|v| (kv.key.clone(), v))
        })
        .collect()
}

// ============================================================================
// Traces
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportTraceServiceRequest {
    #[serde(default, deserialize_with = "de_value_list")]
    pub resource_spans: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpans {
    pub resource: Option<Resource>,
    #[serde(default, deserialize_with = "de_value_list")]
    pub scope_spans: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeSpans {
    pub scope: Option<InstrumentationScope>,
    #[serde(default, deserialize_with = "de_value_list")]
    pub spans: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub trace_state: Option<String>,
    #[serde(default)]
    pub name: String,
    pub kind: Option<i32>,
    #[serde(deserialize_with = "de_i64")]
    pub start_time_unix_nano: i64,
    #[serde(deserialize_with = "de_i64")]
    pub end_time_unix_nano: i64,
    #[serde(default, deserialize_with = "de_lenient_list")]
    pub attributes: Vec<KeyValue>,
    #[serde(default, deserialize_with = "de_lenient_list")]
    pub events: Vec<Event>,
    #[serde(default, deserialize_with = "de_lenient_list")]
    pub links: Vec<Link>,
    pub status: Option<Status>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub time_unix_nano: Option<i64>,
    #[serde(default, deserialize_with = "de_lenient_list")]
    pub attributes: Vec<KeyValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, deserialize_with = "de_lenient_list")]
    pub attributes: Vec<KeyValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub code: Option<i32>,
    pub message: Option<String>,
}

// ============================================================================
// Logs
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportLogsServiceRequest {
    #[serde(default, deserialize_with = "de_value_list")]
    pub resource_logs: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLogs {
    pub resource: Option<Resource>,
    #[serde(default, deserialize_with = "de_value_list")]
    pub scope_logs: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeLogs {
    #[serde(default, deserialize_with = "de_value_list")]
    pub log_records: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub time_unix_nano: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub observed_time_unix_nano: Option<i64>,
    pub severity_number: Option<i32>,
    pub severity_text: Option<String>,
    pub body: Option<AnyValue>,
    #[serde(default, deserialize_with = "de_lenient_list")]
    pub attributes: Vec<KeyValue>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportMetricsServiceRequest {
    #[serde(default, deserialize_with = "de_value_list")]
    pub resource_metrics: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetrics {
    pub resource: Option<Resource>,
    #[serde(default, deserialize_with = "de_value_list")]
    pub scope_metrics: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeMetrics {
    #[serde(default, deserialize_with = "de_value_list")]
    pub metrics: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub unit: String,
    pub gauge: Option<DataPoints>,
    pub sum: Option<DataPoints>,
    pub histogram: Option<DataPoints>,
    pub exponential_histogram: Option<DataPoints>,
    pub summary: Option<DataPoints>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPoints {
    #[serde(default, deserialize_with = "de_value_list")]
    pub data_points: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NumberDataPoint {
    #[serde(default, deserialize_with = "de_lenient_list")]
    pub attributes: Vec<KeyValue>,
    #[serde(deserialize_with = "de_i64")]
    pub time_unix_nano: i64,
    pub as_double: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub as_int: Option<i64>,
}

/// Shared shape of histogram, exponential histogram and summary points
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionDataPoint {
    #[serde(default, deserialize_with = "de_lenient_list")]
    pub attributes: Vec<KeyValue>,
    #[serde(deserialize_with = "de_i64")]
    pub time_unix_nano: i64,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub count: Option<i64>,
    pub sum: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}
