//! Anti-pattern rules evaluated over one trace
//!
//! Rules are pure functions of a [`SpanTree`] and a [`LintConfig`]. Findings
//! are returned grouped by severity, most severe first.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::otel::SpanKind;
use crate::query::SpanTree;

/// Lint thresholds
#[derive(Debug, Clone)]
pub struct LintConfig {
    /// Children allowed under a nested span before `high_fan_out` fires
    pub fan_out: usize,
    /// Children allowed under the root span
    pub root_fan_out: usize,
    /// A childless root at least this long is reported as uninstrumented
    pub leaf_root_min_ms: f64,
    /// Repeats of one operation among siblings that count as N+1
    pub n_plus_one: usize,
}

impl Default for LintConfig {
    fn default() -> Self {
        Self {
            fan_out: 10,
            root_fan_out: 25,
            leaf_root_min_ms: 100.0,
            n_plus_one: 5,
        }
    }
}

impl LintConfig {
    pub fn with_fan_out(mut self, fan_out: usize) -> Self {
        self.fan_out = fan_out;
        self
    }

    pub fn with_root_fan_out(mut self, root_fan_out: usize) -> Self {
        self.root_fan_out = root_fan_out;
        self
    }

    pub fn with_leaf_root_min_ms(mut self, ms: f64) -> Self {
        self.leaf_root_min_ms = ms;
        self
    }

    pub fn with_n_plus_one(mut self, n: usize) -> Self {
        self.n_plus_one = n;
        self
    }
}

/// Finding severity; `Error` sorts first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LintRule {
    ErrorNotPropagated,
    HighFanOut,
    UninstrumentedRoot,
    NPlusOne,
    MissingHttpRoute,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LintFinding {
    pub severity: Severity,
    #[serde(rename = "type")]
    pub rule: LintRule,
    pub message: String,
    pub suggestion: String,
    pub span_name: String,
}

/// Evaluate every rule over the tree
pub fn lint_tree(tree: &SpanTree, config: &LintConfig) -> Vec<LintFinding> {
    let mut findings = Vec::new();

    for &(index, depth) in tree.preorder() {
        let span = tree.span(index);
        let children = tree.children(index);

        // Error swallowed: the caller saw success
        if span.is_error() {
            if let Some(parent) = tree.parent(index).map(|p| tree.span(p)) {
                if !parent.is_error() {
                    findings.push(LintFinding {
                        severity: Severity::Warning,
                        rule: LintRule::ErrorNotPropagated,
                        message: format!(
                            "Span '{}' ({}) failed but its parent '{}' ({}) reports success",
                            span.operation_name,
                            span.service_name,
                            parent.operation_name,
                            parent.service_name
                        ),
                        suggestion: "Set the parent span status to ERROR when a child call fails, \
                                     or record the handled error as a span event"
                            .to_string(),
                        span_name: span.operation_name.clone(),
                    });
                }
            }
        }

        let limit = if depth == 0 {
            config.root_fan_out
        } else {
            config.fan_out
        };
        if children.len() > limit {
            findings.push(LintFinding {
                severity: Severity::Info,
                rule: LintRule::HighFanOut,
                message: format!(
                    "Span '{}' has {} direct children (threshold {})",
                    span.operation_name,
                    children.len(),
                    limit
                ),
                suggestion: "Batch the downstream calls or group them under intermediate spans"
                    .to_string(),
                span_name: span.operation_name.clone(),
            });
        }

        if config.n_plus_one > 0 && children.len() >= config.n_plus_one {
            let mut repeats: BTreeMap<(&str, &str), usize> = BTreeMap::new();
            for &c in children {
                let child = tree.span(c);
                *repeats
                    .entry((child.service_name.as_str(), child.operation_name.as_str()))
                    .or_default() += 1;
            }
            for ((service, operation), count) in repeats {
                if count >= config.n_plus_one {
                    findings.push(LintFinding {
                        severity: Severity::Warning,
                        rule: LintRule::NPlusOne,
                        message: format!(
                            "'{}' calls '{}' on {} {} times",
                            span.operation_name, operation, service, count
                        ),
                        suggestion: "Fetch the data in one batched call instead of one per item"
                            .to_string(),
                        span_name: operation.to_string(),
                    });
                }
            }
        }

        if span.kind == SpanKind::Server && span.http_method().is_some() && span.http_route().is_none()
        {
            findings.push(LintFinding {
                severity: Severity::Info,
                rule: LintRule::MissingHttpRoute,
                message: format!(
                    "Server span '{}' has an HTTP method but no http.route",
                    span.operation_name
                ),
                suggestion: "Enable route capture in the HTTP instrumentation so requests group \
                             by route template"
                    .to_string(),
                span_name: span.operation_name.clone(),
            });
        }
    }

    if let Some(root_index) = tree.root_index() {
        let root = tree.span(root_index);
        if tree.children(root_index).is_empty() && root.duration_ms() >= config.leaf_root_min_ms {
            findings.push(LintFinding {
                severity: Severity::Info,
                rule: LintRule::UninstrumentedRoot,
                message: format!(
                    "Root span '{}' took {:.1} ms with no child spans",
                    root.operation_name,
                    root.duration_ms()
                ),
                suggestion: "Instrument the downstream work (database, HTTP clients, queues) \
                             done inside this request"
                    .to_string(),
                span_name: root.operation_name.clone(),
            });
        }
    }

    findings.sort_by_key(|f| f.severity);
    findings
}

/// Finding counts per severity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FindingCounts {
    pub error: usize,
    pub warning: usize,
    pub info: usize,
}

impl FindingCounts {
    pub fn of(findings: &[LintFinding]) -> Self {
        let mut counts = Self::default();
        for finding in findings {
            match finding.severity {
                Severity::Error => counts.error += 1,
                Severity::Warning => counts.warning += 1,
                Severity::Info => counts.info += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::otel::{AttributeValue, SpanStatus};
    use crate::query::tree::tests::make_span;

    const MS: i64 = 1_000_000;

    #[test]
    fn test_error_not_propagated() {
        let mut child = make_span("b", Some("a"), "backend", "compute", 1, 5);
        child.status_code = SpanStatus::Error;
        let mut root = make_span("a", None, "frontend", "GET /hello", 0, 10);
        root.status_code = SpanStatus::Ok;
        let tree = SpanTree::build(vec![root, child]);

        let findings = lint_tree(&tree, &LintConfig::default());
        let finding = findings
            .iter()
            .find(|f| f.rule == LintRule::ErrorNotPropagated)
            .unwrap();
        assert_eq!(finding.severity, Severity::Warning);
        assert_eq!(finding.span_name, "compute");
    }

    #[test]
    fn test_propagated_error_is_clean() {
        let mut child = make_span("b", Some("a"), "backend", "compute", 1, 5);
        child.status_code = SpanStatus::Error;
        let mut root = make_span("a", None, "frontend", "GET /hello", 0, 10);
        root.status_code = SpanStatus::Error;
        let tree = SpanTree::build(vec![root, child]);
        assert!(lint_tree(&tree, &LintConfig::default()).is_empty());
    }

    #[test]
    fn test_fan_out_thresholds() {
        let mut spans = vec![make_span("root", None, "api", "GET /", 0, 10)];
        spans.push(make_span("mid", Some("root"), "api", "work", 0, 10));
        for i in 0..4 {
            spans.push(make_span(&format!("c{}", i), Some("mid"), "api", &format!("step{}", i), 1, 2));
        }
        let tree = SpanTree::build(spans);

        let config = LintConfig::default().with_fan_out(3).with_root_fan_out(1);
        let fan_out: Vec<_> = lint_tree(&tree, &config)
            .into_iter()
            .filter(|f| f.rule == LintRule::HighFanOut)
            .collect();
        assert_eq!(fan_out.len(), 1);
        assert_eq!(fan_out[0].span_name, "work");
        assert_eq!(fan_out[0].severity, Severity::Info);
    }

    #[test]
    fn test_uninstrumented_root() {
        let tree = SpanTree::build(vec![make_span("a", None, "api", "GET /slow", 0, 250 * MS)]);
        let findings = lint_tree(&tree, &LintConfig::default());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].rule, LintRule::UninstrumentedRoot);

        let fast = SpanTree::build(vec![make_span("a", None, "api", "GET /fast", 0, 5 * MS)]);
        assert!(lint_tree(&fast, &LintConfig::default()).is_empty());
    }

    #[test]
    fn test_n_plus_one_and_ordering() {
        let mut root = make_span("root", None, "api", "GET /users", 0, 10 * MS);
        root.attributes.insert(
            "http.method".to_string(),
            AttributeValue::String("GET".to_string()),
        );
        let mut spans = vec![root];
        for i in 0..5 {
            spans.push(make_span(&format!("q{}", i), Some("root"), "api", "SELECT user", i, i + 1));
        }
        let tree = SpanTree::build(spans);

        let findings = lint_tree(&tree, &LintConfig::default());
        let rules: Vec<LintRule> = findings.iter().map(|f| f.rule).collect();
        assert_eq!(rules, vec![LintRule::NPlusOne, LintRule::MissingHttpRoute]);
        assert_eq!(findings[0].span_name, "SELECT user");

        let counts = FindingCounts::of(&findings);
        assert_eq!(counts, FindingCounts { error: 0, warning: 1, info: 1 });
    }

    #[test]
    fn test_finding_json() {
        let finding = LintFinding {
            severity: Severity::Warning,
            rule: LintRule::ErrorNotPropagated,
            message: "m".to_string(),
            suggestion: "s".to_string(),
            span_name: "compute".to_string(),
        };
        let json = serde_json::to_value(&finding).unwrap();
        assert_eq!(json["severity"], "warning");
        assert_eq!(json["type"], "error_not_propagated");
    }
}
