//! Search filters
//!
//! A request carries a flat list of `{field, operator, value}` filters.
//! Filters on the same field with a positive operator (`eq`, `contains`,
//! `regex`) form one OR group, so "any of these namespaces" is expressed by
//! repeating the field. Groups are ANDed. Negative (`ne`) and range operators
//! always form their own group.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

use crate::otel::{AttributeValue, LogRecord, MetricPoint, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    Eq,
    Ne,
    Contains,
    Regex,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl FilterOperator {
    fn is_disjunctive(&self) -> bool {
        matches!(
            self,
            FilterOperator::Eq | FilterOperator::Contains | FilterOperator::Regex
        )
    }
}

fn default_operator() -> FilterOperator {
    FilterOperator::Eq
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    #[serde(default = "default_operator")]
    pub operator: FilterOperator,
    pub value: serde_json::Value,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            field: field.into(),
            operator: FilterOperator::Eq,
            value: value.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("Invalid regex for field '{field}': {source}")]
    InvalidRegex {
        field: String,
        #[source]
        source: regex::Error,
    },

    #[error("Operator '{operator:?}' on field '{field}' needs a numeric value")]
    NotNumeric {
        field: String,
        operator: FilterOperator,
    },

    #[error("Filter field must not be empty")]
    EmptyField,
}

/// A field value as seen by filters
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue<'a> {
    Str(Cow<'a, str>),
    Num(f64),
    Bool(bool),
}

impl<'a> FieldValue<'a> {
    fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Num(n) => Some(*n),
            FieldValue::Str(s) => s.parse().ok(),
            FieldValue::Bool(_) => None,
        }
    }

    fn as_text(&self) -> Cow<'_, str> {
        match self {
            FieldValue::Str(s) => Cow::Borrowed(s.as_ref()),
            FieldValue::Num(n) => Cow::Owned(n.to_string()),
            FieldValue::Bool(b) => Cow::Owned(b.to_string()),
        }
    }

    fn equals(&self, target: &serde_json::Value) -> bool {
        match (self, target) {
            (FieldValue::Str(s), serde_json::Value::String(t)) => s == t,
            (FieldValue::Bool(b), serde_json::Value::Bool(t)) => b == t,
            (FieldValue::Bool(b), serde_json::Value::String(t)) => t.parse::<bool>() == Ok(*b),
            (_, serde_json::Value::Number(n)) => match (self.as_f64(), n.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
            (FieldValue::Num(n), serde_json::Value::String(t)) => t.parse::<f64>() == Ok(*n),
            _ => false,
        }
    }
}

impl<'a> From<&'a AttributeValue> for FieldValue<'a> {
    fn from(value: &'a AttributeValue) -> Self {
        match value {
            AttributeValue::String(s) => FieldValue::Str(Cow::Borrowed(s)),
            AttributeValue::Int(i) => FieldValue::Num(*i as f64),
            AttributeValue::Float(f) => FieldValue::Num(*f),
            AttributeValue::Bool(b) => FieldValue::Bool(*b),
            other => FieldValue::Str(Cow::Owned(other.to_string())),
        }
    }
}

fn text(s: &str) -> Option<FieldValue<'_>> {
    Some(FieldValue::Str(Cow::Borrowed(s)))
}

/// Anything filters can be evaluated against
pub trait Filterable {
    fn field_value(&self, field: &str) -> Option<FieldValue<'_>>;
}

/// Attribute keys may be written bare or with an `attr.` prefix
fn attribute_key(field: &str) -> &str {
    field
        .strip_prefix("attr.")
        .or_else(|| field.strip_prefix("attributes."))
        .unwrap_or(field)
}

impl Filterable for Span {
    fn field_value(&self, field: &str) -> Option<FieldValue<'_>> {
        match field {
            "service.name" | "service_name" | "service" => text(&self.service_name),
            "name" | "operation_name" | "operation" | "span_name" => text(&self.operation_name),
            "status_code" | "status" => text(self.status_code.as_str()),
            "kind" | "span_kind" => text(self.kind.as_str()),
            "trace_id" => text(&self.trace_id),
            "span_id" => text(&self.span_id),
            "parent_span_id" => self.parent_span_id.as_deref().and_then(text),
            "duration_ns" => Some(FieldValue::Num(self.duration_ns() as f64)),
            "duration_ms" => Some(FieldValue::Num(self.duration_ms())),
            other => self.attribute(attribute_key(other)).map(FieldValue::from),
        }
    }
}

impl Filterable for LogRecord {
    fn field_value(&self, field: &str) -> Option<FieldValue<'_>> {
        match field {
            "service.name" | "service_name" | "service" => text(&self.service_name),
            "severity_text" | "severity" | "level" => text(&self.severity_text),
            "severity_number" => Some(FieldValue::Num(self.severity_number as f64)),
            "body" | "message" => Some(FieldValue::from(&self.body)),
            "trace_id" => self.trace_id.as_deref().and_then(text),
            "span_id" => self.span_id.as_deref().and_then(text),
            other => {
                let key = attribute_key(other);
                self.attributes
                    .get(key)
                    .or_else(|| self.resource.attributes.get(key))
                    .map(FieldValue::from)
            }
        }
    }
}

impl Filterable for MetricPoint {
    fn field_value(&self, field: &str) -> Option<FieldValue<'_>> {
        match field {
            "name" | "metric_name" => text(&self.name),
            "service.name" | "service_name" | "service" => text(&self.service_name),
            "type" | "metric_type" => text(self.metric_type.as_str()),
            "unit" => text(&self.unit),
            "value" => Some(FieldValue::Num(self.value)),
            other => self.attributes.get(attribute_key(other)).map(FieldValue::from),
        }
    }
}

#[derive(Debug)]
enum Matcher {
    Eq(serde_json::Value),
    Ne(serde_json::Value),
    Contains(String),
    Regex(Regex),
    Compare(FilterOperator, f64),
}

#[derive(Debug)]
struct Condition {
    field: String,
    matcher: Matcher,
}

impl Condition {
    fn compile(filter: &Filter) -> Result<Self, FilterError> {
        if filter.field.trim().is_empty() {
            return Err(FilterError::EmptyField);
        }

        let value_text = match &filter.value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        let matcher = match filter.operator {
            FilterOperator::Eq => Matcher::Eq(filter.value.clone()),
            FilterOperator::Ne => Matcher::Ne(filter.value.clone()),
            FilterOperator::Contains => Matcher::Contains(value_text),
            FilterOperator::Regex => {
                Matcher::Regex(Regex::new(&value_text).map_err(|source| {
                    FilterError::InvalidRegex {
                        field: filter.field.clone(),
                        source,
                    }
                })?)
            }
            op @ (FilterOperator::Gt
            | FilterOperator::Gte
            | FilterOperator::Lt
            | FilterOperator::Lte) => {
                let threshold = filter
                    .value
                    .as_f64()
                    .or_else(|| value_text.parse().ok())
                    .ok_or_else(|| FilterError::NotNumeric {
                        field: filter.field.clone(),
                        operator: op,
                    })?;
                Matcher::Compare(op, threshold)
            }
        };

        Ok(Self {
            field: filter.field.clone(),
            matcher,
        })
    }

    fn is_negative(&self) -> bool {
        matches!(self.matcher, Matcher::Ne(_))
    }

    fn matches<T: Filterable + ?Sized>(&self, item: &T) -> bool {
        let value = item.field_value(&self.field);
        match (&self.matcher, value) {
            // A missing field is "not equal" to anything
            (Matcher::Ne(_), None) => true,
            (_, None) => false,
            (Matcher::Eq(target), Some(v)) => v.equals(target),
            (Matcher::Ne(target), Some(v)) => !v.equals(target),
            (Matcher::Contains(needle), Some(v)) => v.as_text().contains(needle.as_str()),
            (Matcher::Regex(re), Some(v)) => re.is_match(&v.as_text()),
            (Matcher::Compare(op, threshold), Some(v)) => match v.as_f64() {
                Some(n) => match op {
                    FilterOperator::Gt => n > *threshold,
                    FilterOperator::Gte => n >= *threshold,
                    FilterOperator::Lt => n < *threshold,
                    FilterOperator::Lte => n <= *threshold,
                    _ => false,
                },
                None => false,
            },
        }
    }
}

/// Compiled filters: an AND of OR groups
#[derive(Debug, Default)]
pub struct FilterSet {
    groups: Vec<Vec<Condition>>,
}

impl FilterSet {
    pub fn compile(filters: &[Filter]) -> Result<Self, FilterError> {
        let mut groups: Vec<(Option<(String, FilterOperator)>, Vec<Condition>)> = Vec::new();

        for filter in filters {
            let condition = Condition::compile(filter)?;
            if filter.operator.is_disjunctive() {
                let key = (filter.field.clone(), filter.operator);
                if let Some((_, group)) = groups
                    .iter_mut()
                    .find(|(k, _)| k.as_ref() == Some(&key))
                {
                    group.push(condition);
                    continue;
                }
                groups.push((Some(key), vec![condition]));
            } else {
                groups.push((None, vec![condition]));
            }
        }

        Ok(Self {
            groups: groups.into_iter().map(|(_, g)| g).collect(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Evaluate against one record
    pub fn matches<T: Filterable + ?Sized>(&self, item: &T) -> bool {
        self.groups
            .iter()
            .all(|group| group.iter().any(|c| c.matches(item)))
    }

    /// Evaluate against a set of records (the spans of one trace).
    ///
    /// A positive group holds when some record satisfies it; a `ne` group
    /// holds only when every record does, so `status_code ne ERROR` keeps
    /// traces with no failing span at all.
    pub fn matches_any<T: Filterable>(&self, items: &[T]) -> bool {
        self.groups.iter().all(|group| {
            if group.len() == 1 && group[0].is_negative() {
                items.iter().all(|item| group[0].matches(item))
            } else {
                items
                    .iter()
                    .any(|item| group.iter().any(|c| c.matches(item)))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::otel::{Attributes, Resource, SpanKind, SpanStatus};
    use std::sync::Arc;

    fn span(service: &str, name: &str, status: SpanStatus, namespace: &str) -> Span {
        let mut attrs = Attributes::new();
        attrs.insert(
            "k8s.namespace.name".to_string(),
            AttributeValue::String(namespace.to_string()),
        );
        attrs.insert("http.status_code".to_string(), AttributeValue::Int(200));
        Span {
            trace_id: "5b8aa5a2d2c872e8321cf37308d69df2".to_string(),
            span_id: "051581bf3cb55c13".to_string(),
            parent_span_id: None,
            trace_state: String::new(),
            service_name: service.to_string(),
            operation_name: name.to_string(),
            kind: SpanKind::Server,
            start_time_unix_nano: 0,
            end_time_unix_nano: 5_000_000,
            status_code: status,
            status_message: String::new(),
            attributes: attrs,
            events: vec![],
            links: vec![],
            resource: Arc::new(Resource::default()),
            scope_name: String::new(),
            scope_version: String::new(),
        }
    }

    fn compile(filters: serde_json::Value) -> FilterSet {
        let filters: Vec<Filter> = serde_json::from_value(filters).unwrap();
        FilterSet::compile(&filters).unwrap()
    }

    #[test]
    fn test_eq_and_default_operator() {
        let s = span("frontend", "GET /", SpanStatus::Ok, "shop");
        assert!(compile(serde_json::json!([{"field": "service.name", "value": "frontend"}])).matches(&s));
        assert!(!compile(serde_json::json!([{"field": "service", "operator": "eq", "value": "backend"}])).matches(&s));
        assert!(compile(serde_json::json!([{"field": "http.status_code", "value": 200}])).matches(&s));
        assert!(compile(serde_json::json!([{"field": "attr.http.status_code", "value": "200"}])).matches(&s));
    }

    #[test]
    fn test_same_field_is_or_across_fields_is_and() {
        let filters = compile(serde_json::json!([
            {"field": "k8s.namespace.name", "operator": "eq", "value": "shop"},
            {"field": "k8s.namespace.name", "operator": "eq", "value": "billing"},
            {"field": "status_code", "operator": "eq", "value": "OK"}
        ]));

        assert!(filters.matches(&span("a", "x", SpanStatus::Ok, "shop")));
        assert!(filters.matches(&span("a", "x", SpanStatus::Ok, "billing")));
        assert!(!filters.matches(&span("a", "x", SpanStatus::Ok, "other")));
        assert!(!filters.matches(&span("a", "x", SpanStatus::Error, "shop")));
    }

    #[test]
    fn test_ne_filters_are_anded() {
        let filters = compile(serde_json::json!([
            {"field": "service", "operator": "ne", "value": "a"},
            {"field": "service", "operator": "ne", "value": "b"}
        ]));
        assert!(!filters.matches(&span("a", "x", SpanStatus::Ok, "n")));
        assert!(!filters.matches(&span("b", "x", SpanStatus::Ok, "n")));
        assert!(filters.matches(&span("c", "x", SpanStatus::Ok, "n")));
    }

    #[test]
    fn test_range_contains_regex() {
        let s = span("checkout", "POST /orders", SpanStatus::Ok, "shop");
        assert!(compile(serde_json::json!([{"field": "duration_ms", "operator": "gte", "value": 5}])).matches(&s));
        assert!(!compile(serde_json::json!([{"field": "duration_ms", "operator": "gt", "value": 5}])).matches(&s));
        assert!(compile(serde_json::json!([{"field": "name", "operator": "contains", "value": "orders"}])).matches(&s));
        assert!(compile(serde_json::json!([{"field": "service", "operator": "regex", "value": "^check"}])).matches(&s));
    }

    #[test]
    fn test_compile_errors() {
        let bad_regex = vec![Filter {
            field: "service".to_string(),
            operator: FilterOperator::Regex,
            value: serde_json::json!("("),
        }];
        assert!(matches!(
            FilterSet::compile(&bad_regex),
            Err(FilterError::InvalidRegex { .. })
        ));

        let not_numeric = vec![Filter {
            field: "duration_ms".to_string(),
            operator: FilterOperator::Gt,
            value: serde_json::json!("slow"),
        }];
        assert!(matches!(
            FilterSet::compile(&not_numeric),
            Err(FilterError::NotNumeric { .. })
        ));

        let unknown: Result<Vec<Filter>, _> =
            serde_json::from_value(serde_json::json!([{"field": "a", "operator": "in", "value": []}]));
        assert!(unknown.is_err());
    }

    #[test]
    fn test_trace_level_matching() {
        let spans = vec![
            span("frontend", "GET /", SpanStatus::Ok, "shop"),
            span("backend", "compute", SpanStatus::Error, "shop"),
        ];

        let has_backend = compile(serde_json::json!([
            {"field": "service", "value": "backend"},
            {"field": "name", "value": "GET /"}
        ]));
        assert!(has_backend.matches_any(&spans));

        let no_errors = compile(serde_json::json!([
            {"field": "status_code", "operator": "ne", "value": "ERROR"}
        ]));
        assert!(!no_errors.matches_any(&spans));
        assert!(no_errors.matches_any(&spans[..1]));
    }
}
