//! Search request shapes shared by trace, log and metric search

use serde::{Deserialize, Serialize};

use super::cursor::{Cursor, CursorError};
use super::filter::{Filter, FilterError, FilterSet};

pub const DEFAULT_LIMIT: usize = 50;
pub const MAX_LIMIT: usize = 1000;

/// Inclusive time range in unix nanoseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start_time: i64,
    pub end_time: i64,
}

impl TimeRange {
    pub fn new(start_time: i64, end_time: i64) -> Self {
        Self {
            start_time,
            end_time,
        }
    }

    /// The window of `window_nanos` ending at `now`
    pub fn last(window_nanos: i64, now: i64) -> Self {
        Self::new(now.saturating_sub(window_nanos), now)
    }

    pub fn contains(&self, t: i64) -> bool {
        t >= self.start_time && t <= self.end_time
    }

    /// Whether `[start, end]` shares at least one instant with this range
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        start <= self.end_time && end >= self.start_time
    }

    pub fn duration_secs(&self) -> f64 {
        (self.end_time.saturating_sub(self.start_time).max(1)) as f64 / 1e9
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub cursor: Option<String>,
}

/// JSON body of the search endpoints
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub time_range: Option<TimeRange>,
    #[serde(default)]
    pub filters: Option<Vec<Filter>>,
    #[serde(default)]
    pub pagination: Pagination,
    /// Show the platform's own telemetry
    #[serde(default)]
    pub include_platform: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Cursor(#[from] CursorError),

    #[error("Time range start ({start}) is after end ({end})")]
    InvertedTimeRange { start: i64, end: i64 },
}

/// A validated search ready to run against a store
#[derive(Debug)]
pub struct SearchQuery {
    pub time_range: TimeRange,
    pub filters: FilterSet,
    pub limit: usize,
    pub after: Option<Cursor>,
    pub include_platform: bool,
}

impl SearchQuery {
    pub fn new(time_range: TimeRange) -> Self {
        Self {
            time_range,
            filters: FilterSet::default(),
            limit: DEFAULT_LIMIT,
            after: None,
            include_platform: false,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.clamp(1, MAX_LIMIT);
        self
    }

    pub fn with_cursor(mut self, cursor: Option<Cursor>) -> Self {
        self.after = cursor;
        self
    }

    pub fn with_filters(mut self, filters: FilterSet) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_platform(mut self, include_platform: bool) -> Self {
        self.include_platform = include_platform;
        self
    }

    /// Whether a sort key belongs to the page being requested
    pub fn admits(&self, time: i64, id: &str) -> bool {
        self.time_range.contains(time) && self.is_past_cursor(time, id)
    }

    /// Whether a sort key sorts after the cursor, ignoring the time range
    pub fn is_past_cursor(&self, time: i64, id: &str) -> bool {
        self.after.as_ref().map_or(true, |c| c.is_before(time, id))
    }
}

impl SearchRequest {
    /// Validate the request; a missing time range defaults to `default_window` ending now
    pub fn compile(&self, now: i64, default_window: i64) -> Result<SearchQuery, QueryError> {
        let time_range = self
            .time_range
            .unwrap_or_else(|| TimeRange::last(default_window, now));
        if time_range.start_time > time_range.end_time {
            return Err(QueryError::InvertedTimeRange {
                start: time_range.start_time,
                end: time_range.end_time,
            });
        }

        let filters = FilterSet::compile(self.filters.as_deref().unwrap_or_default())?;
        let cursor = self
            .pagination
            .cursor
            .as_deref()
            .filter(|c| !c.is_empty())
            .map(Cursor::decode)
            .transpose()?;

        Ok(SearchQuery::new(time_range)
            .with_filters(filters)
            .with_limit(self.pagination.limit.unwrap_or(DEFAULT_LIMIT))
            .with_cursor(cursor)
            .with_platform(self.include_platform))
    }
}

/// Pagination block returned with every search response
#[derive(Debug, Serialize)]
pub struct PageInfo {
    pub next_cursor: Option<String>,
    pub has_more: bool,
    pub limit: usize,
}

impl PageInfo {
    pub fn new(next_cursor: Option<&Cursor>, limit: usize) -> Self {
        Self {
            next_cursor: next_cursor.map(Cursor::encode),
            has_more: next_cursor.is_some(),
            limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_defaults() {
        let request: SearchRequest = serde_json::from_value(serde_json::json!({})).unwrap();
        let query = request.compile(10_000, 1_000).unwrap();
        assert_eq!(query.time_range, TimeRange::new(9_000, 10_000));
        assert_eq!(query.limit, DEFAULT_LIMIT);
        assert!(query.after.is_none());
        assert!(query.filters.is_empty());
        assert!(!query.include_platform);
    }

    #[test]
    fn test_extreme_range() {
        let range = TimeRange::new(i64::MIN, i64::MAX);
        assert!(range.duration_secs() > 0.0);
        assert!(range.overlaps(0, 0));
        assert!(!TimeRange::new(10, 20).overlaps(21, 30));
        assert!(TimeRange::new(10, 20).overlaps(0, 10));
    }

    #[test]
    fn test_compile_full_request() {
        let cursor = Cursor::new(500, "abc").encode();
        let request: SearchRequest = serde_json::from_value(serde_json::json!({
            "time_range": {"start_time": 1, "end_time": 1000},
            "filters": [{"field": "service.name", "operator": "eq", "value": "api"}],
            "pagination": {"limit": 5000, "cursor": cursor},
            "include_platform": true
        }))
        .unwrap();

        let query = request.compile(0, 0).unwrap();
        assert_eq!(query.limit, MAX_LIMIT);
        assert_eq!(query.after, Some(Cursor::new(500, "abc")));
        assert!(query.include_platform);
        assert!(query.admits(499, "zzz"));
        assert!(!query.admits(500, "abc"));
        assert!(!query.admits(1001, "a"));
    }

    #[test]
    fn test_null_filters_accepted() {
        let request: SearchRequest =
            serde_json::from_value(serde_json::json!({"filters": null})).unwrap();
        assert!(request.compile(10, 10).unwrap().filters.is_empty());
    }

    #[test]
    fn test_inverted_range_rejected() {
        let request = SearchRequest {
            time_range: Some(TimeRange::new(10, 1)),
            ..Default::default()
        };
        assert!(matches!(
            request.compile(0, 0),
            Err(QueryError::InvertedTimeRange { .. })
        ));
    }
}
