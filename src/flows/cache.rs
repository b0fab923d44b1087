//! Cached lint findings per representative trace
//!
//! Findings are a pure function of a trace's live spans. Each entry carries a
//! fingerprint of the spans it was computed from and is only served for a
//! tree with the same fingerprint, so spans added by ingest or removed by
//! expiry force a recompute. Ingestion also invalidates touched trace ids to
//! free memory early.

use moka::sync::Cache;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::lint::{lint_tree, LintConfig, LintFinding};
use crate::query::SpanTree;

const DEFAULT_CAPACITY: u64 = 10_000;

#[derive(Clone)]
struct CachedFindings {
    fingerprint: u64,
    findings: Arc<Vec<LintFinding>>,
}

/// Hash of everything the lint rules read from a tree
fn fingerprint(tree: &SpanTree) -> u64 {
    let mut hasher = fxhash::FxHasher64::default();
    tree.len().hash(&mut hasher);
    for span in tree.spans() {
        span.span_id.hash(&mut hasher);
        span.parent_span_id.hash(&mut hasher);
        span.service_name.hash(&mut hasher);
        span.operation_name.hash(&mut hasher);
        span.kind.hash(&mut hasher);
        span.status_code.hash(&mut hasher);
        span.start_time_unix_nano.hash(&mut hasher);
        span.end_time_unix_nano.hash(&mut hasher);
    }
    hasher.finish()
}

pub struct LintCache {
    cache: Cache<String, CachedFindings>,
    config: LintConfig,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LintCache {
    /// Entries live no longer than the spans they describe
    pub fn new(config: LintConfig, ttl: Duration) -> Self {
        Self::with_capacity(config, DEFAULT_CAPACITY, ttl)
    }

    pub fn with_capacity(config: LintConfig, max_entries: u64, ttl: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(ttl)
                .build(),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Findings for a trace, recomputed whenever its spans differ from the cached ones
    pub fn findings(&self, tree: &SpanTree) -> Arc<Vec<LintFinding>> {
        let key = tree.trace_id().to_string();
        let fingerprint = fingerprint(tree);
        if let Some(cached) = self.cache.get(&key) {
            if cached.fingerprint == fingerprint {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return cached.findings;
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let findings = Arc::new(lint_tree(tree, &self.config));
        self.cache.insert(
            key,
            CachedFindings {
                fingerprint,
                findings: findings.clone(),
            },
        );
        findings
    }

    pub fn invalidate_many<'a>(&self, trace_ids: impl IntoIterator<Item = &'a str>) {
        for trace_id in trace_ids {
            self.cache.invalidate(trace_id);
        }
    }

    pub fn stats(&self) -> LintCacheStats {
        LintCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.cache.entry_count(),
        }
    }
}

impl Default for LintCache {
    fn default() -> Self {
        Self::new(LintConfig::default(), Duration::from_secs(30 * 60))
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct LintCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entry_count: u64,
}
