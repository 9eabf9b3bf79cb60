//! Cache manager: decides between the cache file and a rebuild, keeps rebuilds
//! single-flight, and publishes immutable snapshots to concurrent readers.
//!
//! Readers clone an `Arc<CacheSnapshot>` under a read lock and search it with
//! no lock held. History fetches, index construction, and disk writes all
//! happen outside the lock; the write lock only covers the pointer swap.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use anyhow::anyhow;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use ring::digest::{Context as DigestContext, SHA256};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::model::types::{CompactEntry, HistoryRecord};
use crate::search::fuzzy::{FuzzyResult, FuzzyScorer};
use crate::search::index::CacheSnapshot;
use crate::storage::HistoryQuerier;
use crate::storage::binary_format;

/// Records fingerprinted to decide whether the cache file is still current.
pub const FRESHNESS_SAMPLE: usize = 20;

/// How often callers blocked on another thread's build re-check.
const BUILD_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    Empty,
    Loading,
    Valid,
    Rebuilding,
}

impl CacheState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => CacheState::Loading,
            2 => CacheState::Valid,
            3 => CacheState::Rebuilding,
            _ => CacheState::Empty,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            CacheState::Empty => 0,
            CacheState::Loading => 1,
            CacheState::Valid => 2,
            CacheState::Rebuilding => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub entry_count: usize,
    pub trigram_count: usize,
    pub file_size_bytes: u64,
    /// When the in-memory snapshot was built.
    pub last_modified: Option<DateTime<Utc>>,
    /// Modification time of the cache file, if it exists.
    pub file_mod_time: Option<DateTime<Utc>>,
    pub state: CacheState,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Entries: {}, Trigrams: {}, File: {} bytes, Modified: {}",
            self.entry_count,
            self.trigram_count,
            self.file_size_bytes,
            self.file_mod_time
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_else(|| "-".into())
        )
    }
}

/// Handle to the fuzzy history cache. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: CacheConfig,
    scorer: FuzzyScorer,
    source: Arc<dyn HistoryQuerier>,
    snapshot: RwLock<Option<Arc<CacheSnapshot>>>,
    building: AtomicBool,
    state: AtomicU8,
    /// Message of the last failed build, for callers that waited on it.
    last_build_error: Mutex<Option<String>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// Holds the single-flight flag; releasing happens on drop, so errors and
/// panics cannot leave it set.
struct BuildGuard<'a>(&'a AtomicBool);

impl<'a> BuildGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BuildGuard(flag))
    }

    fn acquire(flag: &'a AtomicBool) -> Self {
        loop {
            if let Some(guard) = Self::try_acquire(flag) {
                return guard;
            }
            std::thread::sleep(BUILD_POLL_INTERVAL);
        }
    }
}

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("cache_file", &self.inner.config.cache_file)
            .field("state", &self.state())
            .finish()
    }
}

impl CacheManager {
    pub fn new(config: CacheConfig, source: Arc<dyn HistoryQuerier>) -> Result<Self, CacheError> {
        config.validate()?;
        let scorer = FuzzyScorer::new(&config);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                scorer,
                source,
                snapshot: RwLock::new(None),
                building: AtomicBool::new(false),
                state: AtomicU8::new(CacheState::Empty.as_u8()),
                last_build_error: Mutex::new(None),
                background: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn state(&self) -> CacheState {
        CacheState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Fuzzy search. An empty query returns [`top_entries`](Self::top_entries).
    pub fn search(&self, query: &str) -> Result<FuzzyResult, CacheError> {
        let snapshot = self.snapshot()?;
        Ok(self.inner.scorer.search(&snapshot, query, Utc::now()))
    }

    /// The best-ranked entries without any query.
    pub fn top_entries(&self) -> Result<FuzzyResult, CacheError> {
        let snapshot = self.snapshot()?;
        Ok(self.inner.scorer.top_entries(&snapshot))
    }

    /// Inline-completion candidate for what has been typed so far.
    pub fn best_prefix_match(&self, prefix: &str) -> Result<Option<String>, CacheError> {
        let snapshot = self.snapshot()?;
        Ok(snapshot.best_prefix_match(prefix).map(str::to_string))
    }

    /// Current snapshot, loading or building one first if there is none.
    pub fn snapshot(&self) -> Result<Arc<CacheSnapshot>, CacheError> {
        self.inner.snapshot_or_build()
    }

    /// Rebuild from the history source now, waiting for any build in flight
    /// first. The new snapshot is persisted in the background.
    pub fn rebuild(&self) -> Result<Arc<CacheSnapshot>, CacheError> {
        let guard = BuildGuard::acquire(&self.inner.building);
        self.inner.rebuild(&guard)
    }

    /// Drop the current snapshot and cache file, then rebuild. Returns at once.
    pub fn invalidate_and_refresh(&self) {
        self.inner.spawn_background("hfc-refresh", |inner| {
            let guard = BuildGuard::acquire(&inner.building);
            *inner.snapshot.write() = None;
            inner.set_state(CacheState::Empty);
            remove_cache_file(&inner.config.cache_file);
            if let Err(e) = inner.rebuild(&guard) {
                warn!(error = %e, "cache_refresh_failed");
            }
        });
    }

    /// Rebuild in the background if history changed since the snapshot was
    /// built, so the next start finds a current file. Returns at once.
    pub fn on_application_exit(&self) {
        self.inner.spawn_background("hfc-exit-refresh", |inner| {
            let Some(guard) = BuildGuard::try_acquire(&inner.building) else {
                debug!("exit refresh skipped: build already in flight");
                return;
            };
            let current = match inner.current_fingerprint() {
                Ok(hash) => hash,
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "exit refresh skipped: history unavailable");
                    return;
                }
            };
            let recorded = inner.current().map(|s| s.content_hash);
            if recorded == Some(current) {
                debug!("exit refresh skipped: cache is current");
                return;
            }
            if let Err(e) = inner.rebuild(&guard) {
                warn!(error = %e, "exit_refresh_failed");
            }
        });
    }

    /// Wait up to `grace` for background persists and refreshes. Returns
    /// whether all of them finished.
    pub fn shutdown(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            let pending = self.inner.reap_background();
            if pending == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                warn!(pending, "shutdown grace period elapsed with background work pending");
                return false;
            }
            std::thread::sleep(BUILD_POLL_INTERVAL);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let snapshot = self.inner.current();
        let meta = std::fs::metadata(&self.inner.config.cache_file).ok();
        CacheStats {
            entry_count: snapshot.as_ref().map_or(0, |s| s.entry_count()),
            trigram_count: snapshot.as_ref().map_or(0, |s| s.trigram_count()),
            file_size_bytes: meta.as_ref().map_or(0, |m| m.len()),
            last_modified: snapshot
                .as_ref()
                .and_then(|s| Utc.timestamp_opt(s.last_modified, 0).single()),
            file_mod_time: meta
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from),
            state: self.state(),
        }
    }
}

impl Inner {
    fn current(&self) -> Option<Arc<CacheSnapshot>> {
        self.snapshot.read().clone()
    }

    fn set_state(&self, state: CacheState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn snapshot_or_build(&self) -> Result<Arc<CacheSnapshot>, CacheError> {
        loop {
            if let Some(snapshot) = self.current() {
                return Ok(snapshot);
            }
            if let Some(guard) = BuildGuard::try_acquire(&self.building) {
                if let Some(snapshot) = self.current() {
                    return Ok(snapshot);
                }
                return self.load_or_build(&guard);
            }

            while self.building.load(Ordering::Acquire) {
                std::thread::sleep(BUILD_POLL_INTERVAL);
            }
            if let Some(snapshot) = self.current() {
                return Ok(snapshot);
            }
            if let Some(message) = self.last_build_error.lock().clone() {
                return Err(CacheError::SourceUnavailable(anyhow!(message)));
            }
        }
    }

    fn load_or_build(&self, guard: &BuildGuard<'_>) -> Result<Arc<CacheSnapshot>, CacheError> {
        self.set_state(CacheState::Loading);
        let path = &self.config.cache_file;
        let file_usable = path.exists() && binary_format::is_valid_cache_file(path);

        if file_usable && file_age(path).is_some_and(|age| age < self.config.ttl) {
            if let Some(snapshot) = self.load_fresh_file() {
                return Ok(snapshot);
            }
        } else {
            debug!(path = %path.display(), file_usable, "cache file missing, invalid, or expired");
        }

        match self.rebuild(guard) {
            Ok(snapshot) => Ok(snapshot),
            Err(err) if file_usable => match binary_format::load(path, self.config.use_mmap) {
                Ok(stale) => {
                    warn!(error = %err, "history unavailable; serving expired cache file");
                    Ok(self.publish(stale))
                }
                Err(_) => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    /// Decode the file and check it against the current history sample.
    fn load_fresh_file(&self) -> Option<Arc<CacheSnapshot>> {
        let path = &self.config.cache_file;
        let started = Instant::now();
        let snapshot = match binary_format::load(path, self.config.use_mmap) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cache file rejected; rebuilding");
                return None;
            }
        };

        match self.current_fingerprint() {
            Ok(hash) if hash == snapshot.content_hash => {}
            Ok(_) => {
                debug!("history changed since cache file was written");
                return None;
            }
            Err(e) => {
                warn!(
                    error = %format!("{e:#}"),
                    "history unavailable; using cache file unverified"
                );
            }
        }

        info!(
            entries = snapshot.entry_count(),
            elapsed_ms = started.elapsed().as_millis(),
            "cache_loaded_from_file"
        );
        Some(self.publish(snapshot))
    }

    fn rebuild(&self, _guard: &BuildGuard<'_>) -> Result<Arc<CacheSnapshot>, CacheError> {
        self.set_state(CacheState::Rebuilding);
        *self.last_build_error.lock() = None;
        let started = Instant::now();

        let records = match self.source.get_history(i64::from(self.config.max_entries)) {
            Ok(records) => records,
            Err(e) => {
                let message = format!("{e:#}");
                *self.last_build_error.lock() = Some(message.clone());
                self.set_state(if self.current().is_some() {
                    CacheState::Valid
                } else {
                    CacheState::Empty
                });
                warn!(error = %message, "cache_rebuild_failed");
                return Err(CacheError::SourceUnavailable(e));
            }
        };

        let now = Utc::now();
        let sample = records.len().min(self.sample_size());
        let content_hash = history_fingerprint(&records[..sample]);
        let entries: Vec<CompactEntry> = records
            .iter()
            .map(|r| CompactEntry::from_record(r, now))
            .collect();
        let snapshot = CacheSnapshot::build(entries, content_hash, now);
        let snapshot = self.publish(snapshot);

        info!(
            entries = snapshot.entry_count(),
            trigrams = snapshot.trigram_count(),
            elapsed_ms = started.elapsed().as_millis(),
            "cache_rebuilt"
        );
        self.spawn_persist(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    fn publish(&self, snapshot: CacheSnapshot) -> Arc<CacheSnapshot> {
        let snapshot = Arc::new(snapshot);
        *self.snapshot.write() = Some(Arc::clone(&snapshot));
        *self.last_build_error.lock() = None;
        self.set_state(CacheState::Valid);
        snapshot
    }

    fn sample_size(&self) -> usize {
        FRESHNESS_SAMPLE.min(self.config.max_entries as usize)
    }

    fn current_fingerprint(&self) -> anyhow::Result<[u8; 32]> {
        let sample = self.source.get_history(self.sample_size() as i64)?;
        Ok(history_fingerprint(&sample))
    }

    fn spawn_persist(&self, snapshot: Arc<CacheSnapshot>) {
        let path = self.config.cache_file.clone();
        let use_mmap = self.config.use_mmap;
        self.spawn_detached("hfc-persist", move || {
            let started = Instant::now();
            match binary_format::save(&snapshot, &path, use_mmap) {
                Ok(()) => debug!(
                    path = %path.display(),
                    elapsed_ms = started.elapsed().as_millis(),
                    "cache_persisted"
                ),
                Err(source) => {
                    let err = CacheError::Persist { path, source };
                    warn!(error = %err, "cache_persist_failed");
                }
            }
        });
    }

    fn spawn_background<F>(self: &Arc<Self>, name: &str, task: F)
    where
        F: FnOnce(&Inner) + Send + 'static,
    {
        let inner = Arc::clone(self);
        self.spawn_detached(name, move || task(&inner));
    }

    fn spawn_detached<F>(&self, name: &str, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let dispatch = tracing::dispatcher::get_default(|d| d.clone());
        let spawned = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || tracing::dispatcher::with_default(&dispatch, task));
        match spawned {
            Ok(handle) => {
                let mut handles = self.background.lock();
                join_finished(&mut handles);
                handles.push(handle);
            }
            Err(e) => warn!(task = name, error = %e, "failed to spawn background task"),
        }
    }

    /// Join finished background threads; returns how many are still running.
    fn reap_background(&self) -> usize {
        let mut handles = self.background.lock();
        join_finished(&mut handles);
        handles.len()
    }
}

/// Join and drop every finished handle, keeping the running ones.
fn join_finished(handles: &mut Vec<JoinHandle<()>>) {
    let (finished, running): (Vec<_>, Vec<_>) =
        handles.drain(..).partition(JoinHandle::is_finished);
    *handles = running;
    for handle in finished {
        if handle.join().is_err() {
            warn!("background cache task panicked");
        }
    }
}

/// SHA-256 over each record's URL, visit count, and RFC 3339 last-visit time.
pub fn history_fingerprint(records: &[HistoryRecord]) -> [u8; 32] {
    let mut ctx = DigestContext::new(&SHA256);
    for record in records {
        ctx.update(record.url.as_bytes());
        ctx.update(b"\x1f");
        if let Some(visits) = record.visit_count {
            ctx.update(visits.to_string().as_bytes());
        }
        ctx.update(b"\x1f");
        if let Some(at) = record.last_visited {
            ctx.update(at.to_rfc3339().as_bytes());
        }
        ctx.update(b"\x1e");
    }
    let digest = ctx.finish();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(digest.as_ref());
    hash
}

fn file_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(SystemTime::now().duration_since(modified).unwrap_or(Duration::ZERO))
}

fn remove_cache_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "cache file removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove cache file"),
    }
}
