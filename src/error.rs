//! Error taxonomy for the history cache.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the cache layer.
///
/// Only [`CacheError::SourceUnavailable`] and [`CacheError::Config`] ever reach
/// callers of the [`CacheManager`](crate::manager::CacheManager). Corrupt files
/// fall back to a rebuild and persistence failures are logged.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The history source could not be queried during a cold build.
    #[error("history source unavailable: {0:#}")]
    SourceUnavailable(#[source] anyhow::Error),

    /// The on-disk cache failed magic, version, checksum, or bounds validation.
    #[error("corrupt cache file {path}: {reason}")]
    CorruptFile { path: PathBuf, reason: String },

    /// Writing the cache file in the background failed.
    #[error("failed to persist cache to {path}: {source:#}")]
    Persist {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// Invalid configuration.
    #[error("invalid cache configuration: {0}")]
    Config(String),
}
