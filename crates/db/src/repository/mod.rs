//! Repository functions — one function per database operation.
//!
//! Every function takes a `&DbPool` and returns a `Result<T, DbError>`.
//! No business logic, no domain types — pure SQL.
//!
//! List operations are cursor-based: the cursor is the opaque string form of
//! the last returned row's insertion sequence, so pages stay stable while
//! new rows are inserted.

pub mod executions;
pub mod handoffs;
pub mod workflows;

use serde::Serialize;

use crate::DbError;

/// Upper bound for any single page.
pub const MAX_PAGE_SIZE: i64 = 100;

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// `None` when this is the last page.
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            next_cursor: self.next_cursor,
        }
    }
}

/// Decode a cursor into the sequence number to resume after.
pub fn decode_cursor(cursor: Option<&str>) -> Result<i64, DbError> {
    match cursor {
        None => Ok(0),
        Some(raw) => raw
            .parse::<i64>()
            .ok()
            .filter(|seq| *seq >= 0)
            .ok_or_else(|| DbError::InvalidCursor(raw.to_owned())),
    }
}

pub(crate) fn clamp_limit(limit: i64) -> i64 {
    limit.clamp(1, MAX_PAGE_SIZE)
}

/// Build a page from `limit + 1` fetched rows.
pub(crate) fn paginate<T>(mut rows: Vec<T>, limit: i64, seq_of: impl Fn(&T) -> i64) -> Page<T> {
    let limit = limit as usize;
    let next_cursor = if rows.len() > limit {
        rows.truncate(limit);
        rows.last().map(|r| seq_of(r).to_string())
    } else {
        None
    };
    Page {
        items: rows,
        next_cursor,
    }
}
