//! `SQLite` table behind the favorites cache.
//!
//! Unlike the history database this one belongs to us, so the table is
//! created on open.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, Row, params};
use tracing::info;

use crate::cache::BackingStore;
use crate::model::types::Favorite;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS favorites (
    url TEXT PRIMARY KEY,
    title TEXT NOT NULL DEFAULT '',
    favicon_url TEXT,
    position INTEGER NOT NULL DEFAULT 0
);";

/// Read-write connection to the favorites database.
pub struct SqliteFavorites {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteFavorites {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteFavorites")
            .field("path", &self.path)
            .finish()
    }
}

impl SqliteFavorites {
    /// Open (creating if needed) the database and its `favorites` table.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let start = Instant::now();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating favorites dir {}", parent.display()))?;
        }
        let conn = Connection::open(&path)
            .with_context(|| format!("opening favorites db at {}", path.display()))?;
        conn.busy_timeout(std::time::Duration::from_millis(500))
            .context("setting busy timeout")?;
        conn.execute_batch(SCHEMA)
            .context("creating favorites table")?;
        info!(
            path = %path.display(),
            elapsed_ms = start.elapsed().as_millis(),
            "opened favorites database"
        );
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }
}

impl BackingStore<String, Favorite> for SqliteFavorites {
    fn load_all(&self) -> Result<Vec<(String, Favorite)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT url, title, favicon_url, position FROM favorites \
                 ORDER BY position ASC, url ASC",
            )
            .context("preparing favorites query")?;
        let rows = stmt
            .query_map([], row_to_favorite)
            .context("querying favorites")?;
        rows.map(|row| row.map(|fav| (fav.url.clone(), fav)))
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("reading favorite rows")
    }

    fn persist(&self, key: &String, value: &Favorite) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO favorites (url, title, favicon_url, position)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(url) DO UPDATE SET
                     title = excluded.title,
                     favicon_url = excluded.favicon_url,
                     position = excluded.position",
                params![key, value.title, value.favicon_url, value.position],
            )
            .with_context(|| format!("saving favorite {key}"))?;
        Ok(())
    }

    fn delete(&self, key: &String) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM favorites WHERE url = ?1", params![key])
            .with_context(|| format!("deleting favorite {key}"))?;
        Ok(())
    }
}

fn row_to_favorite(row: &Row<'_>) -> rusqlite::Result<Favorite> {
    Ok(Favorite {
        url: row.get(0)?,
        title: row.get(1)?,
        favicon_url: row.get(2)?,
        position: row.get(3)?,
    })
}
