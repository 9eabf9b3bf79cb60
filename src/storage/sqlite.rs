//! Read-only `SQLite` history source.
//!
//! Reads the browser's `history` table; the schema belongs to the browser and
//! is never created or migrated here.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, Row, params};
use tracing::info;

use super::HistoryQuerier;
use crate::model::types::HistoryRecord;

const HISTORY_QUERY: &str = "SELECT id, url, title, favicon_url, visit_count, last_visited \
     FROM history ORDER BY last_visited DESC, id DESC LIMIT ?1";

/// Lazily opened, read-only connection to a history database.
///
/// Construction does no I/O; the database is opened on the first query so a
/// warm cache file never touches it.
pub struct SqliteHistory {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for SqliteHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteHistory")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .finish()
    }
}

impl SqliteHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            conn: Mutex::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        self.conn.lock().is_some()
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock();
        if guard.is_none() {
            if !self.path.exists() {
                bail!("history database not found at {}", self.path.display());
            }
            let start = Instant::now();
            let conn = Connection::open_with_flags(
                &self.path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .with_context(|| format!("opening history db readonly at {}", self.path.display()))?;
            conn.busy_timeout(std::time::Duration::from_millis(500))
                .context("setting busy timeout")?;
            info!(
                path = %self.path.display(),
                elapsed_ms = start.elapsed().as_millis(),
                "opened history database"
            );
            *guard = Some(conn);
        }
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => bail!("history database connection unavailable"),
        }
    }
}

impl HistoryQuerier for SqliteHistory {
    fn get_history(&self, limit: i64) -> Result<Vec<HistoryRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(HISTORY_QUERY)
                .context("preparing history query")?;
            let rows = stmt
                .query_map(params![limit], row_to_record)
                .context("querying history")?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("reading history rows")
        })
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<HistoryRecord> {
    Ok(HistoryRecord {
        id: row.get(0)?,
        url: row.get(1)?,
        title: row.get(2)?,
        favicon_url: row.get(3)?,
        visit_count: row.get(4)?,
        last_visited: parse_timestamp(row.get_ref(5)?),
    })
}

/// Accept RFC 3339 text, `YYYY-MM-DD HH:MM:SS` text (SQLite's
/// `CURRENT_TIMESTAMP`), or integer Unix seconds. Anything else reads as absent.
fn parse_timestamp(value: ValueRef<'_>) -> Option<DateTime<Utc>> {
    match value {
        ValueRef::Integer(secs) => Utc.timestamp_opt(secs, 0).single(),
        ValueRef::Text(raw) => {
            let text = std::str::from_utf8(raw).ok()?.trim();
            DateTime::parse_from_rfc3339(text)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
                        .ok()
                        .map(|naive| naive.and_utc())
                })
        }
        _ => None,
    }
}
