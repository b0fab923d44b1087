//! Opaque pagination cursors
//!
//! A cursor is the sort key of the last item on a page: `(time, id)`.
//! Results are ordered newest first, so the next page holds every key
//! strictly below the cursor. Data ingested after the first page with a newer
//! timestamp sorts above the cursor and never shifts later pages.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor {
    pub time: i64,
    pub id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CursorError {
    #[error("Invalid pagination cursor")]
    Invalid,
}

impl Cursor {
    pub fn new(time: i64, id: impl Into<String>) -> Self {
        Self {
            time,
            id: id.into(),
        }
    }

    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}:{}", self.time, self.id))
    }

    pub fn decode(encoded: &str) -> Result<Self, CursorError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|_| CursorError::Invalid)?;
        let raw = String::from_utf8(bytes).map_err(|_| CursorError::Invalid)?;
        let (time, id) = raw.split_once(':').ok_or(CursorError::Invalid)?;
        Ok(Self {
            time: time.parse().map_err(|_| CursorError::Invalid)?,
            id: id.to_string(),
        })
    }

    /// True when `(time, id)` sorts strictly after this cursor in newest-first order
    pub fn is_before(&self, time: i64, id: &str) -> bool {
        (time, id) < (self.time, self.id.as_str())
    }
}

/// One page of results and the cursor to continue from
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<Cursor>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next_cursor: None,
        }
    }
}

/// Take up to `limit` items from an already ordered, already filtered stream.
///
/// Looks one item ahead so a cursor is only handed out when another page
/// actually exists.
pub fn paginate<T>(mut items: impl Iterator<Item = (Cursor, T)>, limit: usize) -> Page<T> {
    let mut page = Vec::with_capacity(limit.min(256));
    let mut last_key = None;

    for (key, item) in items.by_ref() {
        if page.len() == limit {
            return Page {
                items: page,
                next_cursor: last_key,
            };
        }
        page.push(item);
        last_key = Some(key);
    }

    Page {
        items: page,
        next_cursor: None,
    }
}
