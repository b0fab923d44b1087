//! Memory budget for stored telemetry
//!
//! Sizes are estimates from string lengths and attribute counts, not
//! allocator truth. The budget only has to stop unbounded growth.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::otel::{AttributeValue, Attributes, LogRecord, MetricPoint, Span};

#[derive(Debug)]
pub struct MemoryTracker {
    current_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
    max_bytes: usize,
}

impl MemoryTracker {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            current_bytes: AtomicUsize::new(0),
            peak_bytes: AtomicUsize::new(0),
            max_bytes,
        }
    }

    /// Reserve `bytes` if the budget allows; all or nothing
    pub fn try_allocate(&self, bytes: usize) -> bool {
        let mut current = self.current_bytes.load(Ordering::SeqCst);
        loop {
            let next = current.saturating_add(bytes);
            if next > self.max_bytes {
                return false;
            }
            match self.current_bytes.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    self.peak_bytes.fetch_max(next, Ordering::SeqCst);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn free(&self, bytes: usize) {
        let _ = self
            .current_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                Some(c.saturating_sub(bytes))
            });
    }

    pub fn current(&self) -> usize {
        self.current_bytes.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak_bytes.load(Ordering::SeqCst)
    }

    pub fn max(&self) -> usize {
        self.max_bytes
    }

    /// Usage as a fraction of the budget
    pub fn usage_ratio(&self) -> f64 {
        if self.max_bytes == 0 {
            return 0.0;
        }
        self.current() as f64 / self.max_bytes as f64
    }

    /// More than 80% of the budget in use
    pub fn is_under_pressure(&self) -> bool {
        self.usage_ratio() > 0.8
    }
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self::new(512 * 1024 * 1024)
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MemoryStats {
    pub current_bytes: usize,
    pub peak_bytes: usize,
    pub max_bytes: usize,
    pub usage_ratio: f64,
    pub under_pressure: bool,
}

impl From<&MemoryTracker> for MemoryStats {
    fn from(tracker: &MemoryTracker) -> Self {
        Self {
            current_bytes: tracker.current(),
            peak_bytes: tracker.peak(),
            max_bytes: tracker.max(),
            usage_ratio: tracker.usage_ratio(),
            under_pressure: tracker.is_under_pressure(),
        }
    }
}

/// Approximate heap plus inline footprint of a stored record
pub trait EstimateSize {
    fn estimated_bytes(&self) -> usize;
}

fn value_bytes(value: &AttributeValue) -> usize {
    16 + match value {
        AttributeValue::String(s) => s.len(),
        AttributeValue::Bytes(b) => b.len(),
        AttributeValue::Array(values) => values.iter().map(value_bytes).sum(),
        AttributeValue::Map(map) => attributes_bytes(map),
        _ => 8,
    }
}

fn attributes_bytes(attributes: &Attributes) -> usize {
    attributes
        .iter()
        .map(|(k, v)| 48 + k.len() + value_bytes(v))
        .sum()
}

impl EstimateSize for Span {
    fn estimated_bytes(&self) -> usize {
        // Resource is shared across the batch and not charged per span
        256 + self.trace_id.len()
            + self.span_id.len()
            + self.parent_span_id.as_ref().map_or(0, String::len)
            + self.trace_state.len()
            + self.service_name.len()
            + self.operation_name.len()
            + self.status_message.len()
            + self.scope_name.len()
            + self.scope_version.len()
            + attributes_bytes(&self.attributes)
            + self
                .events
                .iter()
                .map(|e| 64 + e.name.len() + attributes_bytes(&e.attributes))
                .sum::<usize>()
            + self
                .links
                .iter()
                .map(|l| 64 + l.trace_id.len() + l.span_id.len() + attributes_bytes(&l.attributes))
                .sum::<usize>()
    }
}

impl EstimateSize for LogRecord {
    fn estimated_bytes(&self) -> usize {
        160 + self.trace_id.as_ref().map_or(0, String::len)
            + self.span_id.as_ref().map_or(0, String::len)
            + self.service_name.len()
            + self.severity_text.len()
            + value_bytes(&self.body)
            + attributes_bytes(&self.attributes)
    }
}

impl EstimateSize for MetricPoint {
    fn estimated_bytes(&self) -> usize {
        128 + self.service_name.len()
            + self.name.len()
            + self.description.len()
            + self.unit.len()
            + attributes_bytes(&self.attributes)
    }
}
