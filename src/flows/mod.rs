//! Trace flows: traces grouped by structural shape, with lint findings
//!
//! A flow is derived on read from whatever traces the store currently holds.
//! Nothing here is written back to storage.

pub mod cache;
pub mod lint;
pub mod shape;

pub use cache::{LintCache, LintCacheStats};
pub use lint::{lint_tree, FindingCounts, LintConfig, LintFinding, LintRule, Severity};
pub use shape::{flow_hash, FlowShape};

use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashMap;

use crate::query::SpanTree;

/// Example trace ids kept per flow
pub const MAX_EXAMPLES: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct TraceFlow {
    pub flow_hash: String,
    pub root_service: String,
    pub root_operation: String,
    pub http_method: Option<String>,
    pub http_route: Option<String>,
    pub service_chain: Vec<String>,
    /// Span count of the representative trace
    pub span_count: usize,
    pub trace_count: usize,
    pub error_trace_count: usize,
    pub avg_duration_ms: f64,
    pub last_seen: i64,
    /// Most recent first
    pub example_trace_ids: Vec<String>,
    pub findings: FindingCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowDetail {
    #[serde(flatten)]
    pub flow: TraceFlow,
    pub representative_trace_id: String,
    pub lint_findings: Vec<LintFinding>,
}

struct FlowGroup<'a> {
    shape: FlowShape,
    members: Vec<&'a SpanTree>,
}

fn group_by_shape(trees: &[SpanTree]) -> Vec<(String, FlowGroup<'_>)> {
    let shaped: Vec<(String, FlowShape, &SpanTree)> = trees
        .par_iter()
        .map(|tree| {
            let shape = FlowShape::of(tree);
            (shape.hash(), shape, tree)
        })
        .collect();

    let mut groups: HashMap<String, FlowGroup<'_>> = HashMap::new();
    for (hash, shape, tree) in shaped {
        groups
            .entry(hash)
            .or_insert_with(|| FlowGroup {
                shape,
                members: Vec::new(),
            })
            .members
            .push(tree);
    }
    groups.into_iter().collect()
}

fn summarize<'a>(
    hash: String,
    mut group: FlowGroup<'a>,
    cache: &LintCache,
) -> (TraceFlow, &'a SpanTree) {
    group.members.sort_by(|a, b| {
        b.start_time()
            .cmp(&a.start_time())
            .then_with(|| b.trace_id().cmp(a.trace_id()))
    });
    let representative = group.members[0];
    let findings = cache.findings(representative);

    let trace_count = group.members.len();
    let total_ms: f64 = group
        .members
        .iter()
        .map(|t| t.duration_ns() as f64 / 1_000_000.0)
        .sum();

    let flow = TraceFlow {
        flow_hash: hash,
        root_service: group.shape.root_service,
        root_operation: group.shape.root_operation,
        http_method: group.shape.http_method,
        http_route: group.shape.http_route,
        service_chain: group.shape.service_chain,
        span_count: representative.len(),
        trace_count,
        error_trace_count: group.members.iter().filter(|t| t.has_error()).count(),
        avg_duration_ms: total_ms / trace_count as f64,
        last_seen: representative.start_time(),
        example_trace_ids: group
            .members
            .iter()
            .take(MAX_EXAMPLES)
            .map(|t| t.trace_id().to_string())
            .collect(),
        findings: FindingCounts::of(&findings),
    };
    (flow, representative)
}

/// All flows over a set of traces, busiest first
pub fn build_flows(trees: &[SpanTree], cache: &LintCache) -> Vec<TraceFlow> {
    let mut flows: Vec<TraceFlow> = group_by_shape(trees)
        .into_iter()
        .map(|(hash, group)| summarize(hash, group, cache).0)
        .collect();
    flows.sort_by(|a, b| {
        b.trace_count
            .cmp(&a.trace_count)
            .then_with(|| a.flow_hash.cmp(&b.flow_hash))
    });
    flows
}

/// One flow with the findings of its representative trace
pub fn flow_detail(trees: &[SpanTree], flow_hash: &str, cache: &LintCache) -> Option<FlowDetail> {
    let (hash, group) = group_by_shape(trees)
        .into_iter()
        .find(|(hash, _)| hash == flow_hash)?;
    let (flow, representative) = summarize(hash, group, cache);
    Some(FlowDetail {
        flow,
        representative_trace_id: representative.trace_id().to_string(),
        lint_findings: cache.findings(representative).as_ref().clone(),
    })
}
