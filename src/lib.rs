pub mod cache;
pub mod config;
pub mod error;
pub mod manager;
pub mod model;
pub mod search;
pub mod storage;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use once_cell::sync::Lazy;
use serde::Serialize;

use cache::{BackingStore, FavoritesCache};
use config::CacheConfig;
use manager::CacheManager;
use model::types::Favorite;
use search::fuzzy::{FuzzyResult, MatchType};
use storage::favorites::SqliteFavorites;
use storage::sqlite::SqliteHistory;

/// How long the CLI waits for the background cache write before exiting.
const EXIT_GRACE: Duration = Duration::from_secs(5);

static LONG_VERSION: Lazy<String> = Lazy::new(|| {
    format!(
        "{} (built {}, {})",
        env!("CARGO_PKG_VERSION"),
        option_env!("VERGEN_BUILD_TIMESTAMP").unwrap_or("unknown"),
        option_env!("VERGEN_CARGO_TARGET_TRIPLE").unwrap_or("unknown"),
    )
});

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "hfc",
    version,
    long_version = LONG_VERSION.as_str(),
    about = "Fuzzy search over browser history through a disk-backed cache"
)]
pub struct Cli {
    /// Path to the browser's SQLite history database
    #[arg(long, env = "HFC_HISTORY_DB", global = true)]
    pub db: Option<PathBuf>,

    /// Path to the favorites database (created if missing)
    #[arg(long, env = "HFC_FAVORITES_DB", global = true)]
    pub favorites_db: Option<PathBuf>,

    /// Cache file location (overrides config and HFC_CACHE_FILE)
    #[arg(long, global = true)]
    pub cache_file: Option<PathBuf>,

    /// TOML file with cache settings
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit JSON instead of plain text
    #[arg(long, default_value_t = false, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fuzzy-search history
    Search {
        /// Query words (joined with spaces)
        #[arg(required = true)]
        query: Vec<String>,

        /// Maximum number of results
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show the highest-ranked entries
    Top {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print the best URL completion for a typed prefix
    Prefix { text: String },
    /// Show cache statistics
    Stats,
    /// Rebuild the cache from the history database
    Rebuild,
    /// Print launcher lines: `title | domain | url`
    Dmenu {
        /// Optional query; top entries when omitted
        query: Vec<String>,
    },
    /// Manage favorites
    Favorites {
        #[command(subcommand)]
        action: FavoritesAction,
    },
    /// Generate shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum FavoritesAction {
    /// Add a favorite, or retitle an existing one
    Add {
        url: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        favicon: Option<String>,
    },
    /// Remove a favorite
    Remove { url: String },
    /// List favorites in display order
    List,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "hfc", &mut std::io::stdout());
        return Ok(());
    }
    if let Commands::Favorites { action } = &cli.command {
        let path = cli.favorites_db.clone().unwrap_or_else(default_favorites_path);
        return run_favorites(action, &path, cli.json);
    }

    let limit = match &cli.command {
        Commands::Search { limit, .. } | Commands::Top { limit } => *limit,
        _ => None,
    };
    let config = resolve_config(cli.config.as_ref(), cli.cache_file.clone(), limit)?;
    let db_path = cli.db.clone().unwrap_or_else(default_db_path);
    let manager = CacheManager::new(config, Arc::new(SqliteHistory::new(db_path)))?;

    let outcome = dispatch(&cli, &manager);
    if !manager.shutdown(EXIT_GRACE) {
        tracing::warn!("exiting before the cache file was written");
    }
    outcome
}

fn dispatch(cli: &Cli, manager: &CacheManager) -> Result<()> {
    let mut out = std::io::stdout().lock();
    match &cli.command {
        Commands::Search { query, .. } => {
            let result = manager.search(&query.join(" "))?;
            print_result(&mut out, &result, cli.json)
        }
        Commands::Top { .. } => {
            let result = manager.top_entries()?;
            print_result(&mut out, &result, cli.json)
        }
        Commands::Prefix { text } => {
            let best = manager.best_prefix_match(text)?;
            if cli.json {
                let view = serde_json::json!({ "prefix": text, "url": best });
                serde_json::to_writer(&mut out, &view)?;
                writeln!(out)?;
            } else if let Some(url) = best {
                writeln!(out, "{url}")?;
            }
            Ok(())
        }
        Commands::Stats => {
            // Load (or build) first so the numbers describe a live cache.
            manager.snapshot()?;
            let stats = manager.stats();
            if cli.json {
                serde_json::to_writer_pretty(&mut out, &stats)?;
                writeln!(out)?;
            } else {
                writeln!(out, "{stats}")?;
            }
            Ok(())
        }
        Commands::Rebuild => {
            let snapshot = manager.rebuild()?;
            if cli.json {
                serde_json::to_writer(
                    &mut out,
                    &serde_json::json!({
                        "entries": snapshot.entry_count(),
                        "trigrams": snapshot.trigram_count(),
                        "cache_file": manager.config().cache_file,
                    }),
                )?;
                writeln!(out)?;
            } else {
                writeln!(
                    out,
                    "rebuilt cache: {} entries, {} trigrams ({})",
                    snapshot.entry_count(),
                    snapshot.trigram_count(),
                    manager.config().cache_file.display()
                )?;
            }
            Ok(())
        }
        Commands::Dmenu { query } => {
            let result = if query.is_empty() {
                manager.top_entries()?
            } else {
                manager.search(&query.join(" "))?
            };
            for m in &result.matches {
                writeln!(out, "{}", launcher_line(&m.entry.title, &m.entry.url))?;
            }
            Ok(())
        }
        Commands::Favorites { .. } | Commands::Completions { .. } => Ok(()),
    }
}

fn run_favorites(action: &FavoritesAction, path: &Path, json: bool) -> Result<()> {
    let store: Arc<dyn BackingStore<String, Favorite>> = Arc::new(SqliteFavorites::open(path)?);
    let favorites = FavoritesCache::open(store)?;
    let mut out = std::io::stdout().lock();
    match action {
        FavoritesAction::Add {
            url,
            title,
            favicon,
        } => {
            let added = favorites.add(url, title.as_deref().unwrap_or(""), favicon.clone());
            if json {
                serde_json::to_writer(&mut out, &added)?;
                writeln!(out)?;
            } else {
                writeln!(out, "favorite {}: {}", added.position, added.url)?;
            }
        }
        FavoritesAction::Remove { url } => {
            if !favorites.remove(url) {
                anyhow::bail!("not a favorite: {url}");
            }
        }
        FavoritesAction::List => {
            let all = favorites.all();
            if json {
                serde_json::to_writer(&mut out, &all)?;
                writeln!(out)?;
            } else {
                for fav in &all {
                    writeln!(out, "{}", launcher_line(&fav.title, &fav.url))?;
                }
            }
        }
    }
    favorites.flush();
    Ok(())
}

fn resolve_config(
    path: Option<&PathBuf>,
    cache_file: Option<PathBuf>,
    limit: Option<usize>,
) -> Result<CacheConfig> {
    let mut config = match path {
        Some(path) => CacheConfig::from_toml_file(path)?,
        None => CacheConfig::from_env(),
    };
    if let Some(cache_file) = cache_file {
        config.cache_file = cache_file;
    }
    if let Some(limit) = limit {
        config.max_results = limit;
    }
    config.validate().context("validating configuration")?;
    Ok(config)
}

#[derive(Serialize)]
struct MatchView<'a> {
    url: &'a str,
    title: &'a str,
    score: f64,
    url_score: f64,
    title_score: f64,
    recency_score: f64,
    visit_score: f64,
    visit_count: u16,
    last_visit: DateTime<Utc>,
    match_type: MatchType,
}

#[derive(Serialize)]
struct ResultView<'a> {
    query_time_us: u128,
    matches: Vec<MatchView<'a>>,
}

fn print_result(out: &mut impl Write, result: &FuzzyResult, json: bool) -> Result<()> {
    if json {
        let view = ResultView {
            query_time_us: result.query_time.as_micros(),
            matches: result
                .matches
                .iter()
                .map(|m| MatchView {
                    url: &m.entry.url,
                    title: &m.entry.title,
                    score: m.score,
                    url_score: m.url_score,
                    title_score: m.title_score,
                    recency_score: m.recency_score,
                    visit_score: m.visit_score,
                    visit_count: m.entry.visit_count,
                    last_visit: m.entry.last_visit(),
                    match_type: m.match_type,
                })
                .collect(),
        };
        serde_json::to_writer(&mut *out, &view)?;
        writeln!(out)?;
        return Ok(());
    }
    for m in &result.matches {
        writeln!(
            out,
            "{:.3}  {:<7}  {}  {}",
            m.score,
            format!("{:?}", m.match_type).to_lowercase(),
            m.entry.display(),
            m.entry.url
        )?;
    }
    Ok(())
}

/// `title | domain | url`, the title falling back to the URL and the domain
/// left out when the URL has no host.
pub fn launcher_line(title: &str, url: &str) -> String {
    let title = if title.trim().is_empty() { url } else { title.trim() };
    match url::Url::parse(url).ok().as_ref().and_then(url::Url::host_str) {
        Some(host) => {
            let domain = host.strip_prefix("www.").unwrap_or(host);
            format!("{title} | {domain} | {url}")
        }
        None => format!("{title} | {url}"),
    }
}

/// Default history database: `history.db` in the platform data dir.
pub fn default_db_path() -> PathBuf {
    directories::ProjectDirs::from("com", "history-fuzzy-cache", "history-fuzzy-cache")
        .map(|dirs| dirs.data_dir().join("history.db"))
        .unwrap_or_else(|| PathBuf::from("history.db"))
}

/// Default favorites database: `favorites.db` in the platform data dir.
pub fn default_favorites_path() -> PathBuf {
    directories::ProjectDirs::from("com", "history-fuzzy-cache", "history-fuzzy-cache")
        .map(|dirs| dirs.data_dir().join("favorites.db"))
        .unwrap_or_else(|| PathBuf::from("favorites.db"))
}
