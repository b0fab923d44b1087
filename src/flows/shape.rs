//! Structural fingerprint of a trace
//!
//! Two traces with the same root operation, the same ordered service chain
//! and the same root HTTP method and route share a shape, whatever their ids
//! and timestamps.

use serde::Serialize;
use std::hash::Hasher;

use crate::query::SpanTree;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowShape {
    pub root_service: String,
    pub root_operation: String,
    pub service_chain: Vec<String>,
    pub http_method: Option<String>,
    pub http_route: Option<String>,
}

impl FlowShape {
    pub fn of(tree: &SpanTree) -> Self {
        let root = tree.root();
        Self {
            root_service: root.map(|r| r.service_name.clone()).unwrap_or_default(),
            root_operation: root.map(|r| r.operation_name.clone()).unwrap_or_default(),
            service_chain: tree.service_chain(),
            http_method: root.and_then(|r| r.http_method()).map(str::to_string),
            http_route: root.and_then(|r| r.http_route()).map(str::to_string),
        }
    }

    /// Canonical text form: `op|svc>svc>...|method|route`
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.root_operation,
            self.service_chain.join(">"),
            self.http_method.as_deref().unwrap_or(""),
            self.http_route.as_deref().unwrap_or("")
        )
    }

    /// fxhash64 of the key as 16 lowercase hex chars
    pub fn hash(&self) -> String {
        let mut hasher = fxhash::FxHasher64::default();
        hasher.write(self.key().as_bytes());
        format!("{:016x}", hasher.finish())
    }
}

/// Flow hash of a trace
pub fn flow_hash(tree: &SpanTree) -> String {
    FlowShape::of(tree).hash()
}
