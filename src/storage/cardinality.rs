//! Per-metric series limit
//!
//! Each metric name may hold at most `max_series` live label sets. A point
//! for a new label set beyond the limit is rewritten into the metric's
//! overflow series instead of growing storage. Registrations expire together
//! with the data they describe.

use dashmap::DashMap;
use std::collections::HashMap;

use crate::otel::{AttributeValue, Attributes, MetricPoint};

/// Label marking the overflow series of a metric
pub const OVERFLOW_ATTRIBUTE: &str = "otel.metric.overflow";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Series was already registered
    Existing,
    /// Series registered by this point
    New,
    /// Point was redirected into the overflow series
    Overflow,
}

pub struct CardinalityLimiter {
    max_series: usize,
    /// metric name -> series hash -> expires_at
    series: DashMap<String, HashMap<u64, i64>>,
}

impl CardinalityLimiter {
    pub fn new(max_series: usize) -> Self {
        Self {
            max_series,
            series: DashMap::new(),
        }
    }

    pub fn max_series(&self) -> usize {
        self.max_series
    }

    /// Register the point's series or redirect it to overflow.
    ///
    /// `expires_at` is the expiry of the point being written; a registration
    /// lives as long as the newest point of its series.
    pub fn admit(&self, point: &mut MetricPoint, now: i64, expires_at: i64) -> Admission {
        if is_overflow(&point.attributes) {
            return Admission::Existing;
        }

        let hash = point.series_hash();
        let mut entry = self.series.entry(point.name.clone()).or_default();
        let registered = entry.value_mut();

        if let Some(expiry) = registered.get_mut(&hash) {
            if *expiry > now {
                *expiry = (*expiry).max(expires_at);
                return Admission::Existing;
            }
        }

        if registered.len() >= self.max_series {
            registered.retain(|_, expiry| *expiry > now);
        }
        if registered.len() < self.max_series {
            registered.insert(hash, expires_at);
            return Admission::New;
        }

        let mut overflow = Attributes::new();
        overflow.insert(OVERFLOW_ATTRIBUTE.to_string(), AttributeValue::Bool(true));
        point.attributes = overflow;
        Admission::Overflow
    }

    /// Drop expired registrations; returns how many were removed
    pub fn expire(&self, now: i64) -> usize {
        let mut removed = 0;
        self.series.retain(|_, registered| {
            let before = registered.len();
            registered.retain(|_, expiry| *expiry > now);
            removed += before - registered.len();
            !registered.is_empty()
        });
        removed
    }
}

pub fn is_overflow(attributes: &Attributes) -> bool {
    matches!(
        attributes.get(OVERFLOW_ATTRIBUTE),
        Some(AttributeValue::Bool(true))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::otel::MetricType;

    fn point(route: &str) -> MetricPoint {
        let mut attributes = Attributes::new();
        attributes.insert("route".to_string(), AttributeValue::String(route.to_string()));
        MetricPoint {
            service_name: "api".to_string(),
            name: "http.requests".to_string(),
            description: String::new(),
            unit: "1".to_string(),
            metric_type: MetricType::Sum,
            time_unix_nano: 1,
            value: 1.0,
            count: None,
            min: None,
            max: None,
            attributes,
        }
    }

    #[test]
    fn test_limit_redirects_to_overflow() {
        let limiter = CardinalityLimiter::new(2);

        assert_eq!(limiter.admit(&mut point("/a"), 0, 100), Admission::New);
        assert_eq!(limiter.admit(&mut point("/b"), 0, 100), Admission::New);

        let mut third = point("/c");
        assert_eq!(limiter.admit(&mut third, 0, 100), Admission::Overflow);
        assert!(is_overflow(&third.attributes));
        assert_eq!(third.attributes.len(), 1);

        // Existing series keep working
        assert_eq!(limiter.admit(&mut point("/a"), 0, 100), Admission::Existing);
    }

    #[test]
    fn test_registrations_expire() {
        let limiter = CardinalityLimiter::new(1);
        assert_eq!(limiter.admit(&mut point("/a"), 0, 100), Admission::New);
        assert_eq!(limiter.admit(&mut point("/b"), 50, 150), Admission::Overflow);

        // Once /a has expired, its slot is free again
        assert_eq!(limiter.admit(&mut point("/b"), 100, 200), Admission::New);

        assert_eq!(limiter.expire(300), 1);
        assert_eq!(limiter.expire(300), 0);
    }

    #[test]
    fn test_limits_are_per_metric() {
        let limiter = CardinalityLimiter::new(1);
        let mut other = point("/a");
        other.name = "http.latency".to_string();

        assert_eq!(limiter.admit(&mut point("/a"), 0, 100), Admission::New);
        assert_eq!(limiter.admit(&mut other, 0, 100), Admission::New);
    }
}
