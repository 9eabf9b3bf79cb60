//! History records, favorites, and the compact entries the index is built from.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub const SECONDS_PER_DAY: i64 = 86_400;

/// Visit-count ceiling; counts are saturated to fit a `u16`.
pub const MAX_VISIT_COUNT: u16 = u16::MAX;

/// URLs and titles are cut to this many UTF-8 bytes so they fit a `u16` length prefix.
pub const MAX_TEXT_BYTES: usize = u16::MAX as usize;

/// One row as handed over by the history source. Nullable columns stay `Option`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: i64,
    pub url: String,
    pub title: Option<String>,
    pub favicon_url: Option<String>,
    pub visit_count: Option<i64>,
    pub last_visited: Option<DateTime<Utc>>,
}

impl HistoryRecord {
    pub fn new(id: i64, url: impl Into<String>) -> Self {
        Self {
            id,
            url: url.into(),
            title: None,
            favicon_url: None,
            visit_count: None,
            last_visited: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_visits(mut self, visits: i64) -> Self {
        self.visit_count = Some(visits);
        self
    }

    pub fn with_last_visited(mut self, at: DateTime<Utc>) -> Self {
        self.last_visited = Some(at);
        self
    }
}

/// A pinned URL shown ahead of history in the launcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Favorite {
    pub url: String,
    pub title: String,
    pub favicon_url: Option<String>,
    /// Display order; lower comes first.
    pub position: i64,
}

/// Memory-dense history entry. Immutable once part of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactEntry {
    pub url: String,
    pub title: String,
    /// Saturated at 65535.
    pub visit_count: u16,
    /// Whole days since the Unix epoch.
    pub last_visit_days: u32,
    /// Precomputed base score in `[0, 65535]`; seeds the sorted index.
    pub score: u16,
}

impl CompactEntry {
    /// Build an entry scored against the current time.
    pub fn new(
        url: impl Into<String>,
        title: impl Into<String>,
        visit_count: i64,
        last_visit: DateTime<Utc>,
    ) -> Self {
        Self::new_at(url, title, visit_count, last_visit, Utc::now())
    }

    /// Build an entry scored against `now`.
    pub fn new_at(
        url: impl Into<String>,
        title: impl Into<String>,
        visit_count: i64,
        last_visit: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let visit_count = visit_count.clamp(0, i64::from(MAX_VISIT_COUNT)) as u16;
        let last_visit_days = days_from_time(last_visit);
        Self {
            url: truncate_to_char_boundary(url.into(), MAX_TEXT_BYTES),
            title: truncate_to_char_boundary(title.into(), MAX_TEXT_BYTES),
            visit_count,
            last_visit_days,
            score: base_score(visit_count, last_visit_days, now),
        }
    }

    /// Convert a source record, defaulting absent columns (missing visit time means `now`).
    pub fn from_record(record: &HistoryRecord, now: DateTime<Utc>) -> Self {
        Self::new_at(
            record.url.clone(),
            record.title.clone().unwrap_or_default(),
            record.visit_count.unwrap_or(0),
            record.last_visited.unwrap_or(now),
            now,
        )
    }

    /// Text shown in a launcher: the title, unless it is empty or just the URL.
    pub fn display(&self) -> &str {
        if !self.title.is_empty() && self.title != self.url {
            &self.title
        } else {
            &self.url
        }
    }

    pub fn last_visit(&self) -> DateTime<Utc> {
        time_from_days(self.last_visit_days)
    }

    /// Fractional days between the start of the last-visit day and `now`, never negative.
    pub fn days_since_visit(&self, now: DateTime<Utc>) -> f64 {
        days_since(self.last_visit_days, now)
    }
}

/// `round(65535 * (0.3 * visits/65535 + 0.7 / (1 + days/30)))`
pub fn base_score(visit_count: u16, last_visit_days: u32, now: DateTime<Utc>) -> u16 {
    let visit_score = f64::from(visit_count) / f64::from(MAX_VISIT_COUNT);
    let recency_score = 1.0 / (1.0 + days_since(last_visit_days, now) / 30.0);
    let score = (visit_score * 0.3 + recency_score * 0.7) * f64::from(u16::MAX);
    score.round().clamp(0.0, f64::from(u16::MAX)) as u16
}

pub fn days_from_time(t: DateTime<Utc>) -> u32 {
    let days = t.timestamp().div_euclid(SECONDS_PER_DAY);
    days.clamp(0, i64::from(u32::MAX)) as u32
}

pub fn time_from_days(days: u32) -> DateTime<Utc> {
    Utc.timestamp_opt(i64::from(days) * SECONDS_PER_DAY, 0)
        .single()
        .unwrap_or_else(|| DateTime::<Utc>::UNIX_EPOCH)
}

fn days_since(last_visit_days: u32, now: DateTime<Utc>) -> f64 {
    let elapsed = now.timestamp() - i64::from(last_visit_days) * SECONDS_PER_DAY;
    (elapsed as f64 / SECONDS_PER_DAY as f64).max(0.0)
}

fn truncate_to_char_boundary(mut s: String, max_bytes: usize) -> String {
    if s.len() > max_bytes {
        let mut end = max_bytes;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}
