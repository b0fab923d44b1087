//! Service dependency graph
//!
//! An edge `(a, b)` exists when a span of service `a` directly parents a span
//! of service `b != a`. Client spans carrying `db.system` and producer spans
//! carrying `messaging.system` add database and messaging leaf nodes.
//!
//! Edge latency between services is the parent-child delta: the time the
//! calling span spent outside the called span. Edges into databases and
//! brokers have no called span, so they use the client span's duration.

use serde::Serialize;
use std::collections::BTreeMap;

use super::red::{percentile, red_by_service, RedMetrics};
use super::request::TimeRange;
use super::tree::SpanTree;
use crate::otel::{Span, SpanKind};
use crate::platform::is_visible;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Service,
    Database,
    Messaging,
}

#[derive(Debug, Clone, Serialize)]
pub struct MapNode {
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub metrics: RedMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct MapEdge {
    pub source: String,
    pub target: String,
    /// p95 of the per-call latency delta, in milliseconds
    pub p95: f64,
    /// Number of calls observed
    pub value: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ServiceMap {
    pub nodes: Vec<MapNode>,
    pub edges: Vec<MapEdge>,
}

/// The external system a span talks to, if it is a leaf call into one
fn external_target(span: &Span) -> Option<(NodeType, String)> {
    let (key, node_type) = match span.kind {
        SpanKind::Client => ("db.system", NodeType::Database),
        SpanKind::Producer => ("messaging.system", NodeType::Messaging),
        _ => return None,
    };
    let system = span.attributes.get(key)?.to_string();
    // Prefer the concrete database or destination name when present
    let detail = match node_type {
        NodeType::Database => span.attributes.get("db.name"),
        _ => span.attributes.get("messaging.destination.name"),
    };
    let id = match detail {
        Some(d) => format!("{}:{}", system, d),
        None => system,
    };
    Some((node_type, id))
}

/// Parent duration minus child duration, floored at zero for async children
fn latency_delta_ms(parent: &Span, child: &Span) -> f64 {
    parent.duration_ns().saturating_sub(child.duration_ns()).max(0) as f64 / 1_000_000.0
}

#[derive(Default)]
struct EdgeStats {
    latencies_ms: Vec<f64>,
}

#[derive(Default)]
struct ExternalStats {
    errors: u64,
    durations_ms: Vec<f64>,
}

pub fn build_service_map<'a>(
    trees: impl IntoIterator<Item = &'a SpanTree> + Clone,
    range: &TimeRange,
    include_platform: bool,
) -> ServiceMap {
    let visible = |name: &str| is_visible(name, include_platform);

    let mut edges: BTreeMap<(String, String), EdgeStats> = BTreeMap::new();
    let mut externals: BTreeMap<String, (NodeType, ExternalStats)> = BTreeMap::new();

    for tree in trees.clone() {
        for (index, span) in tree.spans().iter().enumerate() {
            if !range.contains(span.start_time_unix_nano) || !visible(&span.service_name) {
                continue;
            }

            if let Some(parent) = tree.parent(index).map(|p| tree.span(p)) {
                if parent.service_name != span.service_name && visible(&parent.service_name) {
                    edges
                        .entry((parent.service_name.clone(), span.service_name.clone()))
                        .or_default()
                        .latencies_ms
                        .push(latency_delta_ms(parent, span));
                }
            }

            let calls_other_service = tree
                .children(index)
                .iter()
                .any(|c| tree.span(*c).service_name != span.service_name);
            if calls_other_service {
                continue;
            }
            if let Some((node_type, id)) = external_target(span) {
                edges
                    .entry((span.service_name.clone(), id.clone()))
                    .or_default()
                    .latencies_ms
                    .push(span.duration_ms());
                let (_, stats) = externals
                    .entry(id)
                    .or_insert_with(|| (node_type, ExternalStats::default()));
                stats.durations_ms.push(span.duration_ms());
                if span.is_error() {
                    stats.errors += 1;
                }
            }
        }
    }

    let mut nodes: Vec<MapNode> = red_by_service(trees, range, include_platform)
        .into_iter()
        .map(|(name, metrics)| MapNode {
            id: name.clone(),
            label: name,
            node_type: NodeType::Service,
            metrics,
        })
        .collect();

    for (id, (node_type, mut stats)) in externals {
        stats.durations_ms.sort_by(|a, b| a.total_cmp(b));
        let count = stats.durations_ms.len() as u64;
        nodes.push(MapNode {
            id: id.clone(),
            label: id,
            node_type,
            metrics: RedMetrics {
                request_count: count,
                error_count: stats.errors,
                rate: count as f64 / range.duration_secs(),
                error_rate: if count == 0 {
                    0.0
                } else {
                    stats.errors as f64 / count as f64
                },
                duration_p50_ms: percentile(&stats.durations_ms, 50.0),
                duration_p95_ms: percentile(&stats.durations_ms, 95.0),
                duration_p99_ms: percentile(&stats.durations_ms, 99.0),
            },
        });
    }
    nodes.sort_by(|a, b| (a.node_type, &a.id).cmp(&(b.node_type, &b.id)));

    let edges = edges
        .into_iter()
        .map(|((source, target), mut stats)| {
            stats.latencies_ms.sort_by(|a, b| a.total_cmp(b));
            MapEdge {
                source,
                target,
                p95: percentile(&stats.latencies_ms, 95.0),
                value: stats.latencies_ms.len() as u64,
            }
        })
        .collect();

    ServiceMap { nodes, edges }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::otel::AttributeValue;
    use crate::query::tree::tests::make_span;

    const MS: i64 = 1_000_000;

    fn checkout_trace(offset: i64) -> SpanTree {
        let root = make_span("a", None, "frontend", "GET /checkout", offset, offset + 50 * MS);
        let mut call = make_span("b", Some("a"), "frontend", "POST cart", offset + MS, offset + 40 * MS);
        call.kind = SpanKind::Client;
        let mut server = make_span("c", Some("b"), "cart", "POST /cart", offset + 2 * MS, offset + 30 * MS);
        server.kind = SpanKind::Server;
        let mut query = make_span("d", Some("c"), "cart", "SELECT", offset + 3 * MS, offset + 13 * MS);
        query.kind = SpanKind::Client;
        query.attributes.insert(
            "db.system".to_string(),
            AttributeValue::String("postgresql".to_string()),
        );
        SpanTree::build(vec![root, call, server, query])
    }

    #[test]
    fn test_cross_service_edges() {
        let trees = vec![checkout_trace(0), checkout_trace(100 * MS)];
        let map = build_service_map(&trees, &TimeRange::new(0, 1_000 * MS), false);

        let edges: Vec<(&str, &str, u64)> = map
            .edges
            .iter()
            .map(|e| (e.source.as_str(), e.target.as_str(), e.value))
            .collect();
        assert_eq!(
            edges,
            vec![("cart", "postgresql", 2), ("frontend", "cart", 2)]
        );
        // POST cart (39ms) around POST /cart (28ms)
        assert_eq!(map.edges[1].p95, 11.0);
        // Database edge has no called span: the query's own 10ms
        assert_eq!(map.edges[0].p95, 10.0);

        let nodes: Vec<(&str, NodeType)> = map
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), n.node_type))
            .collect();
        assert_eq!(
            nodes,
            vec![
                ("cart", NodeType::Service),
                ("frontend", NodeType::Service),
                ("postgresql", NodeType::Database),
            ]
        );
        assert_eq!(map.nodes[0].metrics.request_count, 2);
        assert_eq!(map.nodes[2].metrics.duration_p50_ms, 10.0);
    }

    #[test]
    fn test_async_child_delta_floors_at_zero() {
        let mut consumer = make_span("b", Some("a"), "worker", "process", 1, 50 * MS);
        consumer.kind = SpanKind::Consumer;
        let trees = vec![SpanTree::build(vec![
            make_span("a", None, "api", "POST /jobs", 0, 2 * MS),
            consumer,
        ])];
        let map = build_service_map(&trees, &TimeRange::new(0, 100 * MS), false);
        assert_eq!(map.edges.len(), 1);
        assert_eq!(map.edges[0].p95, 0.0);
        assert_eq!(map.edges[0].value, 1);
    }

    #[test]
    fn test_no_self_edges() {
        let trees = vec![SpanTree::build(vec![
            make_span("a", None, "api", "GET /", 0, 10),
            make_span("b", Some("a"), "api", "work", 1, 2),
        ])];
        let map = build_service_map(&trees, &TimeRange::new(0, 100), false);
        assert!(map.edges.is_empty());
        assert_eq!(map.nodes.len(), 1);
    }

    #[test]
    fn test_range_excludes_spans() {
        let trees = vec![checkout_trace(0)];
        let map = build_service_map(&trees, &TimeRange::new(500 * MS, 600 * MS), false);
        assert!(map.nodes.is_empty());
        assert!(map.edges.is_empty());
    }

    #[test]
    fn test_serialized_shape() {
        let trees = vec![checkout_trace(0)];
        let map = build_service_map(&trees, &TimeRange::new(0, 1_000 * MS), false);
        let json = serde_json::to_value(&map).unwrap();
        assert_eq!(json["nodes"][2]["type"], "database");
        assert_eq!(json["edges"][0]["source"], "cart");
        assert!(json["nodes"][0]["metrics"]["rate"].is_number());
    }
}
