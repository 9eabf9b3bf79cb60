//! Cache configuration: defaults, `HFC_*` environment overrides, and TOML files.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::CacheError;

/// File name used inside the state directory when no path is configured.
pub const DEFAULT_CACHE_FILE_NAME: &str = "dmenu_fuzzy_cache.bin";

/// Tuning knobs for the fuzzy history cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Path of the binary cache file.
    pub cache_file: PathBuf,
    /// Maximum number of history records pulled from the source.
    pub max_entries: u32,
    /// Minimum trigram matches required (reserved, not consulted yet).
    pub trigram_threshold: u32,
    /// Matches scoring below this are dropped.
    pub score_threshold: f64,
    /// Maximum number of matches returned per request.
    pub max_results: usize,
    pub url_weight: f64,
    pub title_weight: f64,
    pub recency_weight: f64,
    pub visit_weight: f64,
    /// How old the cache file may be before it is ignored.
    pub ttl: Duration,
    /// Background pre-warm (reserved).
    pub warmup_enabled: bool,
    /// Read and write the cache file through a memory map instead of buffered I/O.
    pub use_mmap: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_file: default_cache_path(),
            max_entries: 10_000,
            trigram_threshold: 2,
            score_threshold: 0.2,
            max_results: 50,
            url_weight: 0.4,
            title_weight: 0.3,
            recency_weight: 0.2,
            visit_weight: 0.1,
            ttl: Duration::from_secs(30 * 60),
            warmup_enabled: true,
            use_mmap: true,
        }
    }
}

/// On-disk TOML representation. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    cache_file: Option<PathBuf>,
    max_entries: Option<u32>,
    trigram_threshold: Option<u32>,
    score_threshold: Option<f64>,
    max_results: Option<usize>,
    url_weight: Option<f64>,
    title_weight: Option<f64>,
    recency_weight: Option<f64>,
    visit_weight: Option<f64>,
    ttl_secs: Option<u64>,
    warmup_enabled: Option<bool>,
    use_mmap: Option<bool>,
}

impl CacheConfig {
    /// Defaults overridden by `HFC_*` environment variables (`.env` honoured).
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| dotenvy::var(key).ok())
    }

    /// Defaults overridden by a TOML file, then by the environment.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading cache config {}", path.display()))?;
        let cfg = Self::from_toml_str(&raw)
            .with_context(|| format!("parsing cache config {}", path.display()))?;
        Ok(cfg.with_overrides(|key| dotenvy::var(key).ok()))
    }

    /// Defaults overridden by the given TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(raw)?;
        let mut cfg = Self::default();
        if let Some(v) = file.cache_file {
            cfg.cache_file = v;
        }
        if let Some(v) = file.max_entries {
            cfg.max_entries = v;
        }
        if let Some(v) = file.trigram_threshold {
            cfg.trigram_threshold = v;
        }
        if let Some(v) = file.score_threshold {
            cfg.score_threshold = v;
        }
        if let Some(v) = file.max_results {
            cfg.max_results = v;
        }
        if let Some(v) = file.url_weight {
            cfg.url_weight = v;
        }
        if let Some(v) = file.title_weight {
            cfg.title_weight = v;
        }
        if let Some(v) = file.recency_weight {
            cfg.recency_weight = v;
        }
        if let Some(v) = file.visit_weight {
            cfg.visit_weight = v;
        }
        if let Some(v) = file.ttl_secs {
            cfg.ttl = Duration::from_secs(v);
        }
        if let Some(v) = file.warmup_enabled {
            cfg.warmup_enabled = v;
        }
        if let Some(v) = file.use_mmap {
            cfg.use_mmap = v;
        }
        Ok(cfg)
    }

    /// Apply `HFC_*` overrides read through `lookup`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("HFC_CACHE_FILE") {
            self.cache_file = PathBuf::from(path);
        }
        if let Some(n) = parse_var(&lookup, "HFC_MAX_ENTRIES") {
            self.max_entries = n;
        }
        if let Some(v) = parse_var(&lookup, "HFC_SCORE_THRESHOLD") {
            self.score_threshold = v;
        }
        if let Some(n) = parse_var(&lookup, "HFC_MAX_RESULTS") {
            self.max_results = n;
        }
        if let Some(v) = parse_var(&lookup, "HFC_URL_WEIGHT") {
            self.url_weight = v;
        }
        if let Some(v) = parse_var(&lookup, "HFC_TITLE_WEIGHT") {
            self.title_weight = v;
        }
        if let Some(v) = parse_var(&lookup, "HFC_RECENCY_WEIGHT") {
            self.recency_weight = v;
        }
        if let Some(v) = parse_var(&lookup, "HFC_VISIT_WEIGHT") {
            self.visit_weight = v;
        }
        if let Some(secs) = parse_var(&lookup, "HFC_TTL_SECS") {
            self.ttl = Duration::from_secs(secs);
        }
        if let Some(v) = lookup("HFC_USE_MMAP") {
            self.use_mmap = v != "0" && v.to_lowercase() != "false";
        }
        self
    }

    /// Reject settings that would break scoring invariants.
    pub fn validate(&self) -> Result<(), CacheError> {
        let weights = [
            ("url_weight", self.url_weight),
            ("title_weight", self.title_weight),
            ("recency_weight", self.recency_weight),
            ("visit_weight", self.visit_weight),
        ];
        for (name, w) in weights {
            if !w.is_finite() || w < 0.0 {
                return Err(CacheError::Config(format!(
                    "{name} must be a non-negative number, got {w}"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.score_threshold) {
            return Err(CacheError::Config(format!(
                "score_threshold must be within [0, 1], got {}",
                self.score_threshold
            )));
        }
        if self.max_results == 0 {
            return Err(CacheError::Config("max_results must be non-zero".into()));
        }
        if self.cache_file.as_os_str().is_empty() {
            return Err(CacheError::Config("cache_file must not be empty".into()));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable config override");
            None
        }
    }
}

/// Default location of the cache file: the platform state dir, else the cache
/// dir, else the temp dir.
pub fn default_cache_path() -> PathBuf {
    directories::ProjectDirs::from("com", "history-fuzzy-cache", "history-fuzzy-cache")
        .map(|dirs| {
            dirs.state_dir()
                .unwrap_or_else(|| dirs.cache_dir())
                .join(DEFAULT_CACHE_FILE_NAME)
        })
        .unwrap_or_else(|| std::env::temp_dir().join("history_fuzzy_cache.bin"))
}
