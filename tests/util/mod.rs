//! Shared fixtures for integration tests.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use history_fuzzy_cache::config::CacheConfig;
use history_fuzzy_cache::manager::CacheManager;
use history_fuzzy_cache::model::types::HistoryRecord;
use history_fuzzy_cache::storage::HistoryQuerier;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tempfile::TempDir;

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: Arc<std::sync::Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    /// Install for the current thread. Background threads spawned by the
    /// cache inherit it.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Assert that the captured log output contains the provided substring.
    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

struct TestWriter(Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// In-memory history source with call counting and failure injection.
#[allow(dead_code)]
#[derive(Default)]
pub struct MockHistory {
    records: Mutex<Vec<HistoryRecord>>,
    calls: AtomicUsize,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

#[allow(dead_code)]
impl MockHistory {
    pub fn new(records: Vec<HistoryRecord>) -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(records),
            ..Self::default()
        })
    }

    pub fn set_records(&self, records: Vec<HistoryRecord>) {
        *self.records.lock() = records;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl HistoryQuerier for MockHistory {
    fn get_history(&self, limit: i64) -> anyhow::Result<Vec<HistoryRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("database is locked");
        }
        let mut records = self.records.lock().clone();
        records.sort_by(|a, b| b.last_visited.cmp(&a.last_visited));
        records.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(records)
    }
}

/// Whole-second reference instant shared by every fixture in the process, so
/// two calls to [`sample_history`] produce identical records (and fingerprints).
static ANCHOR: Lazy<DateTime<Utc>> = Lazy::new(|| {
    let now = Utc::now() - ChronoDuration::minutes(1);
    Utc.timestamp_opt(now.timestamp(), 0).single().expect("valid timestamp")
});

#[allow(dead_code)]
pub fn days_ago(days: i64) -> DateTime<Utc> {
    *ANCHOR - ChronoDuration::days(days)
}

#[allow(dead_code)]
pub fn record(id: i64, url: &str, title: &str, visits: i64, days: i64) -> HistoryRecord {
    HistoryRecord::new(id, url)
        .with_title(title)
        .with_visits(visits)
        .with_last_visited(days_ago(days))
}

/// Small history used across the scenario tests.
#[allow(dead_code)]
pub fn sample_history() -> Vec<HistoryRecord> {
    vec![
        record(1, "https://github.com", "GitHub", 50, 1),
        record(2, "https://stackoverflow.com", "Stack Overflow", 30, 2),
        record(3, "https://golang.org", "The Go Programming Language", 20, 3),
        record(4, "https://youtube.com", "YouTube", 10, 4),
        record(5, "https://docs.rs/serde", "serde - Rust", 5, 6),
    ]
}

/// A temp dir plus a config whose cache file lives inside it.
#[allow(dead_code)]
pub struct TempCache {
    pub dir: TempDir,
    pub config: CacheConfig,
}

#[allow(dead_code)]
impl TempCache {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let config = CacheConfig {
            cache_file: dir.path().join("cache").join("history.bin"),
            ..CacheConfig::default()
        };
        Self { dir, config }
    }

    pub fn path(&self) -> PathBuf {
        self.config.cache_file.clone()
    }

    pub fn manager(&self, source: Arc<MockHistory>) -> CacheManager {
        CacheManager::new(self.config.clone(), source).expect("valid config")
    }

    /// Build once and wait for the file to land on disk.
    pub fn warm(&self, source: Arc<MockHistory>) {
        let manager = self.manager(source);
        manager.top_entries().expect("cold build");
        assert!(manager.shutdown(Duration::from_secs(10)), "persist did not finish");
        assert!(self.path().exists(), "cache file missing after warm-up");
    }
}

#[allow(dead_code)]
pub fn assert_float64_eq(a: f64, b: f64, epsilon: f64) {
    assert!(
        (a - b).abs() <= epsilon,
        "float mismatch: {a} vs {b} (epsilon {epsilon})"
    );
}
