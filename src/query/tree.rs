//! Trace reconstruction from a flat span list
//!
//! Spans live in one vector and the tree is an adjacency list of indices,
//! built once per trace. Malformed parent links cannot create cycles in the
//! traversal: orphans become roots, and any span still unreachable after
//! walking every root (a parent cycle) is promoted to a root itself.

use std::collections::{HashMap, HashSet};

use crate::otel::Span;

#[derive(Debug, Clone)]
pub struct SpanTree {
    spans: Vec<Span>,
    parent: Vec<Option<usize>>,
    children: Vec<Vec<usize>>,
    roots: Vec<usize>,
    /// Pre-order traversal as `(index, depth)`
    order: Vec<(usize, usize)>,
}

impl SpanTree {
    /// Build a tree from the spans of one trace
    pub fn build(mut spans: Vec<Span>) -> Self {
        spans.sort_by(|a, b| {
            a.start_time_unix_nano
                .cmp(&b.start_time_unix_nano)
                .then_with(|| a.span_id.cmp(&b.span_id))
        });
        // Keep the earliest copy of a repeated span id
        let mut seen = HashSet::new();
        spans.retain(|s| seen.insert(s.span_id.clone()));

        let index: HashMap<String, usize> = spans
            .iter()
            .enumerate()
            .map(|(i, s)| (s.span_id.clone(), i))
            .collect();

        let mut parent = vec![None; spans.len()];
        let mut children = vec![Vec::new(); spans.len()];
        for (i, span) in spans.iter().enumerate() {
            let p = span
                .parent_span_id
                .as_ref()
                .and_then(|id| index.get(id).copied())
                .filter(|p| *p != i);
            if let Some(p) = p {
                parent[i] = Some(p);
                children[p].push(i);
            }
        }

        // True roots first, then orphans whose parent never arrived
        let mut roots: Vec<usize> = (0..spans.len())
            .filter(|i| parent[*i].is_none() && spans[*i].parent_span_id.is_none())
            .collect();
        roots.extend(
            (0..spans.len()).filter(|i| parent[*i].is_none() && spans[*i].parent_span_id.is_some()),
        );

        let mut tree = Self {
            spans,
            parent,
            children,
            roots: Vec::new(),
            order: Vec::new(),
        };

        let mut visited = vec![false; tree.spans.len()];
        for root in roots {
            tree.add_root(root, &mut visited);
        }

        // Anything left is caught in a parent cycle: break it at the earliest span
        while let Some(i) = visited.iter().position(|v| !v) {
            if let Some(p) = tree.parent[i].take() {
                tree.children[p].retain(|c| *c != i);
            }
            tree.add_root(i, &mut visited);
        }

        tree
    }

    fn add_root(&mut self, root: usize, visited: &mut [bool]) {
        self.roots.push(root);
        let mut stack = vec![(root, 0usize)];
        while let Some((i, depth)) = stack.pop() {
            if visited[i] {
                continue;
            }
            visited[i] = true;
            self.order.push((i, depth));
            for &child in self.children[i].iter().rev() {
                if !visited[child] {
                    stack.push((child, depth + 1));
                }
            }
        }
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub fn span(&self, index: usize) -> &Span {
        &self.spans[index]
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn trace_id(&self) -> &str {
        self.spans.first().map(|s| s.trace_id.as_str()).unwrap_or("")
    }

    pub fn roots(&self) -> &[usize] {
        &self.roots
    }

    pub fn root_index(&self) -> Option<usize> {
        self.roots.first().copied()
    }

    /// The primary root: the earliest parentless span, else the earliest orphan
    pub fn root(&self) -> Option<&Span> {
        self.root_index().map(|i| &self.spans[i])
    }

    pub fn parent(&self, index: usize) -> Option<usize> {
        self.parent[index]
    }

    pub fn children(&self, index: usize) -> &[usize] {
        &self.children[index]
    }

    pub fn preorder(&self) -> &[(usize, usize)] {
        &self.order
    }

    pub fn start_time(&self) -> i64 {
        self.spans
            .iter()
            .map(|s| s.start_time_unix_nano)
            .min()
            .unwrap_or(0)
    }

    pub fn end_time(&self) -> i64 {
        self.spans
            .iter()
            .map(|s| s.end_time_unix_nano)
            .max()
            .unwrap_or(0)
    }

    pub fn duration_ns(&self) -> i64 {
        self.end_time().saturating_sub(self.start_time())
    }

    pub fn has_error(&self) -> bool {
        self.spans.iter().any(Span::is_error)
    }

    /// Services in pre-order, each listed once at its first appearance
    pub fn service_chain(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.order
            .iter()
            .map(|(i, _)| &self.spans[*i].service_name)
            .filter(|s| seen.insert(s.as_str()))
            .cloned()
            .collect()
    }
}
