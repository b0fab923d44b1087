//! Trace views returned by the query API

use serde::Serialize;

use super::tree::SpanTree;
use crate::flows::flow_hash;
use crate::otel::Span;

/// One row of a trace search result
#[derive(Debug, Clone, Serialize)]
pub struct TraceSummary {
    pub trace_id: String,
    pub root_service: String,
    pub root_operation: String,
    pub start_time: i64,
    pub duration_ms: f64,
    pub span_count: usize,
    pub services: Vec<String>,
    pub has_error: bool,
    pub flow_hash: String,
}

impl TraceSummary {
    pub fn from_tree(tree: &SpanTree) -> Self {
        let (root_service, root_operation) = tree
            .root()
            .map(|r| (r.service_name.clone(), r.operation_name.clone()))
            .unwrap_or_default();
        Self {
            trace_id: tree.trace_id().to_string(),
            root_service,
            root_operation,
            start_time: tree.start_time(),
            duration_ms: tree.duration_ns() as f64 / 1_000_000.0,
            span_count: tree.len(),
            services: tree.service_chain(),
            has_error: tree.has_error(),
            flow_hash: flow_hash(tree),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SpanNode<'a> {
    pub depth: usize,
    #[serde(flatten)]
    pub span: &'a Span,
    pub duration_ms: f64,
    pub child_count: usize,
}

/// Full trace: summary plus every span in pre-order
#[derive(Debug, Clone, Serialize)]
pub struct TraceDetail<'a> {
    #[serde(flatten)]
    pub summary: TraceSummary,
    pub spans: Vec<SpanNode<'a>>,
}

impl<'a> TraceDetail<'a> {
    pub fn from_tree(tree: &'a SpanTree) -> Self {
        let spans = tree
            .preorder()
            .iter()
            .map(|&(index, depth)| SpanNode {
                depth,
                span: tree.span(index),
                duration_ms: tree.span(index).duration_ms(),
                child_count: tree.children(index).len(),
            })
            .collect();
        Self {
            summary: TraceSummary::from_tree(tree),
            spans,
        }
    }
}
