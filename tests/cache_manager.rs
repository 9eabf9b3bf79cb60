mod util;

use std::sync::Arc;
use std::time::Duration;

use history_fuzzy_cache::config::CacheConfig;
use history_fuzzy_cache::error::CacheError;
use history_fuzzy_cache::manager::{CacheManager, CacheState};
use history_fuzzy_cache::search::MatchType;
use history_fuzzy_cache::storage::binary_format;
use util::{MockHistory, TempCache, TestTracing, record, sample_history};

const GRACE: Duration = Duration::from_secs(10);

fn urls(result: &history_fuzzy_cache::search::FuzzyResult) -> Vec<&str> {
    result.matches.iter().map(|m| m.entry.url.as_str()).collect()
}

#[test]
fn cold_start_builds_and_answers_queries() {
    let cache = TempCache::new();
    let source = MockHistory::new(sample_history());
    let manager = cache.manager(source.clone());
    assert_eq!(manager.state(), CacheState::Empty);

    let typo = manager.search("githb").unwrap();
    assert_eq!(typo.matches[0].entry.url, "https://github.com");
    assert_eq!(typo.matches[0].match_type, MatchType::Fuzzy);
    assert_eq!(manager.state(), CacheState::Valid);

    let title = manager.search("programming").unwrap();
    assert_eq!(title.matches[0].entry.url, "https://golang.org");
    assert_eq!(title.matches[0].match_type, MatchType::Exact);

    let short = manager.search("you").unwrap();
    assert_eq!(short.matches[0].entry.url, "https://youtube.com");

    assert_eq!(source.calls(), 1, "snapshot should be reused across queries");
    assert!(manager.shutdown(GRACE));
}

#[test]
fn empty_query_lists_entries_by_base_score() {
    let cache = TempCache::new();
    let manager = cache.manager(MockHistory::new(sample_history()));
    let result = manager.search("").unwrap();
    assert_eq!(
        urls(&result),
        vec![
            "https://github.com",
            "https://stackoverflow.com",
            "https://golang.org",
            "https://youtube.com",
            "https://docs.rs/serde",
        ]
    );
    assert!(result.matches.iter().all(|m| m.match_type == MatchType::Exact));
    assert!(result.matches.windows(2).all(|w| w[0].score >= w[1].score));
    assert_eq!(manager.top_entries().unwrap().matches.len(), 5);
    manager.shutdown(GRACE);
}

#[test]
fn short_query_prefers_visits_and_recency() {
    let cache = TempCache::new();
    let manager = cache.manager(MockHistory::new(vec![
        record(1, "https://go.dev/blog", "", 2, 40),
        record(2, "https://go.dev/doc", "", 400, 0),
    ]));
    let result = manager.search("go").unwrap();
    assert_eq!(urls(&result), vec!["https://go.dev/doc", "https://go.dev/blog"]);
    manager.shutdown(GRACE);
}

#[test]
fn fresh_file_is_reused_without_rebuilding() {
    let cache = TempCache::new();
    cache.warm(MockHistory::new(sample_history()));

    let source = MockHistory::new(sample_history());
    let manager = cache.manager(source.clone());
    let result = manager.search("github").unwrap();
    assert_eq!(result.matches[0].entry.url, "https://github.com");
    // Only the freshness sample was fetched.
    assert_eq!(source.calls(), 1);
    assert!(manager.shutdown(GRACE));
}

#[test]
fn changed_history_invalidates_file() {
    let cache = TempCache::new();
    cache.warm(MockHistory::new(sample_history()));

    let mut history = sample_history();
    history.push(record(9, "https://crates.io", "crates.io: Rust Package Registry", 3, 0));
    let source = MockHistory::new(history);
    let manager = cache.manager(source.clone());

    let result = manager.search("crates").unwrap();
    assert_eq!(result.matches[0].entry.url, "https://crates.io");
    assert_eq!(source.calls(), 2, "freshness check plus rebuild");
    manager.shutdown(GRACE);
}

#[test]
fn expired_file_is_not_consulted() {
    let mut cache = TempCache::new();
    cache.warm(MockHistory::new(sample_history()));
    cache.config.ttl = Duration::ZERO;

    let source = MockHistory::new(sample_history());
    let manager = cache.manager(source.clone());
    manager.top_entries().unwrap();
    assert_eq!(source.calls(), 1, "rebuild only, no freshness check");
    manager.shutdown(GRACE);
}

#[test]
fn flipped_magic_byte_falls_back_to_rebuild() {
    let cache = TempCache::new();
    cache.warm(MockHistory::new(sample_history()));

    let mut bytes = std::fs::read(cache.path()).unwrap();
    bytes[0] ^= 0xFF;
    std::fs::write(cache.path(), &bytes).unwrap();
    assert!(!binary_format::is_valid_cache_file(&cache.path()));

    let manager = cache.manager(MockHistory::new(sample_history()));
    let result = manager.search("githb").unwrap();
    assert_eq!(result.matches[0].entry.url, "https://github.com");
    assert!(manager.shutdown(GRACE));
    assert!(binary_format::is_valid_cache_file(&cache.path()), "rebuild should rewrite the file");
}

#[test]
fn corrupt_body_is_rejected_and_logged() {
    let cache = TempCache::new();
    cache.warm(MockHistory::new(sample_history()));

    let mut bytes = std::fs::read(cache.path()).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x5A;
    std::fs::write(cache.path(), &bytes).unwrap();

    let tracing = TestTracing::new();
    let _guard = tracing.install();
    let source = MockHistory::new(sample_history());
    let manager = cache.manager(source.clone());
    assert_eq!(manager.top_entries().unwrap().matches.len(), 5);
    tracing.assert_contains("cache file rejected");
    assert_eq!(source.calls(), 1);
    manager.shutdown(GRACE);
}

#[test]
fn cold_start_with_failing_source_is_an_error() {
    let cache = TempCache::new();
    let source = MockHistory::new(sample_history());
    source.set_failing(true);
    let manager = cache.manager(source.clone());

    let err = manager.search("github").unwrap_err();
    assert!(matches!(err, CacheError::SourceUnavailable(_)), "{err}");
    assert!(err.to_string().contains("database is locked"));
    assert_eq!(manager.state(), CacheState::Empty);

    // Recovers once the source is back.
    source.set_failing(false);
    assert!(!manager.search("github").unwrap().matches.is_empty());
    manager.shutdown(GRACE);
}

#[test]
fn fresh_file_is_used_when_source_fails_during_check() {
    let cache = TempCache::new();
    cache.warm(MockHistory::new(sample_history()));

    let tracing = TestTracing::new();
    let _guard = tracing.install();
    let source = MockHistory::new(sample_history());
    source.set_failing(true);
    let manager = cache.manager(source);

    let result = manager.search("stack").unwrap();
    assert_eq!(result.matches[0].entry.url, "https://stackoverflow.com");
    tracing.assert_contains("using cache file unverified");
}

#[test]
fn expired_file_is_served_when_source_is_down() {
    let mut cache = TempCache::new();
    cache.warm(MockHistory::new(sample_history()));
    cache.config.ttl = Duration::ZERO;

    let source = MockHistory::new(Vec::new());
    source.set_failing(true);
    let manager = cache.manager(source);
    assert_eq!(manager.top_entries().unwrap().matches.len(), 5);
    assert_eq!(manager.state(), CacheState::Valid);
}

#[test]
fn empty_history_yields_minimal_valid_file() {
    let cache = TempCache::new();
    let manager = cache.manager(MockHistory::new(Vec::new()));
    assert!(manager.top_entries().unwrap().matches.is_empty());
    assert!(manager.search("anything").unwrap().matches.is_empty());
    assert_eq!(manager.best_prefix_match("git").unwrap(), None);
    assert!(manager.shutdown(GRACE));

    let len = std::fs::metadata(cache.path()).unwrap().len();
    assert_eq!(len, (binary_format::HEADER_LEN + 8) as u64);
    let snapshot = binary_format::load(&cache.path(), true).unwrap();
    assert_eq!(snapshot.entry_count(), 0);
}

#[test]
fn invalidate_and_refresh_picks_up_new_history() {
    let cache = TempCache::new();
    let source = MockHistory::new(sample_history());
    let manager = cache.manager(source.clone());
    manager.top_entries().unwrap();
    assert!(manager.shutdown(GRACE));

    source.set_records(vec![record(42, "https://rust-lang.org", "Rust", 1, 0)]);
    manager.invalidate_and_refresh();
    assert!(manager.shutdown(GRACE));

    let result = manager.search("rust").unwrap();
    assert_eq!(urls(&result), vec!["https://rust-lang.org"]);
    let on_disk = binary_format::load(&cache.path(), false).unwrap();
    assert_eq!(on_disk.entry_count(), 1);
}

#[test]
fn exit_hook_rebuilds_only_when_history_changed() {
    let cache = TempCache::new();
    let source = MockHistory::new(sample_history());
    let manager = cache.manager(source.clone());
    manager.top_entries().unwrap();

    manager.on_application_exit();
    assert!(manager.shutdown(GRACE));
    assert_eq!(source.calls(), 2, "build plus one freshness check");

    source.set_records(vec![record(7, "https://news.ycombinator.com", "Hacker News", 9, 0)]);
    manager.on_application_exit();
    assert!(manager.shutdown(GRACE));
    assert_eq!(source.calls(), 4, "freshness check plus rebuild");
    assert_eq!(manager.snapshot().unwrap().entry_count(), 1);
}

#[test]
fn best_prefix_match_through_manager() {
    let cache = TempCache::new();
    let manager = cache.manager(MockHistory::new(sample_history()));
    assert_eq!(
        manager.best_prefix_match("https://www.stack").unwrap().as_deref(),
        Some("https://stackoverflow.com")
    );
    assert_eq!(manager.best_prefix_match("").unwrap(), None);
    manager.shutdown(GRACE);
}

#[test]
fn stats_describe_snapshot_and_file() {
    let cache = TempCache::new();
    let manager = cache.manager(MockHistory::new(sample_history()));
    let before = manager.stats();
    assert_eq!(before.entry_count, 0);
    assert_eq!(before.state, CacheState::Empty);

    manager.top_entries().unwrap();
    assert!(manager.shutdown(GRACE));
    let stats = manager.stats();
    assert_eq!(stats.entry_count, 5);
    assert!(stats.trigram_count > 0);
    assert!(stats.file_size_bytes > binary_format::HEADER_LEN as u64);
    assert!(stats.last_modified.is_some());
    assert!(stats.file_mod_time.is_some());
    assert!(stats.to_string().starts_with("Entries: 5, Trigrams: "));
}

#[test]
fn buffered_io_mode_round_trips() {
    let mut cache = TempCache::new();
    cache.config.use_mmap = false;
    cache.warm(MockHistory::new(sample_history()));

    let source = MockHistory::new(sample_history());
    let manager = cache.manager(source.clone());
    assert_eq!(manager.top_entries().unwrap().matches.len(), 5);
    assert_eq!(source.calls(), 1);
}

#[test]
fn invalid_config_is_rejected() {
    let config = CacheConfig {
        max_results: 0,
        ..CacheConfig::default()
    };
    let err = CacheManager::new(config, Arc::new(MockHistory::default())).unwrap_err();
    assert!(matches!(err, CacheError::Config(_)));
}
