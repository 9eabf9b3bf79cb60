//! Persistence: the cache file codec, the history source, and the favorites table.

pub mod binary_format;
pub mod favorites;
pub mod sqlite;

use std::sync::Arc;

use anyhow::Result;

use crate::model::types::HistoryRecord;

/// The one capability the cache needs from the browser: recent history,
/// most recently visited first.
pub trait HistoryQuerier: Send + Sync {
    fn get_history(&self, limit: i64) -> Result<Vec<HistoryRecord>>;
}

impl<T: HistoryQuerier + ?Sized> HistoryQuerier for Arc<T> {
    fn get_history(&self, limit: i64) -> Result<Vec<HistoryRecord>> {
        (**self).get_history(limit)
    }
}

impl<T: HistoryQuerier + ?Sized> HistoryQuerier for Box<T> {
    fn get_history(&self, limit: i64) -> Result<Vec<HistoryRecord>> {
        (**self).get_history(limit)
    }
}
