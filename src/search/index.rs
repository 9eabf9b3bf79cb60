//! Immutable cache snapshot: entries plus every index derived from them.

use chrono::{DateTime, Utc};

use super::normalize::{
    dot_parts, is_indexable_token, normalize_text, strip_scheme_and_www, trie_tokens,
};
use super::trie::PrefixTrie;
use super::trigram::{TrigramIndex, union_sorted};
use crate::model::types::CompactEntry;

/// Upper bound on entries handed to the scorer per query.
pub const MAX_CANDIDATES: usize = 1000;

/// Binary format version a snapshot is serialized with.
pub const SNAPSHOT_VERSION: u32 = 1;

/// One consistent view of the history. Never mutated after construction;
/// refreshes build a new one and swap it in.
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    pub entries: Vec<CompactEntry>,
    pub trigram_index: TrigramIndex,
    pub prefix_trie: PrefixTrie,
    /// Entry indices by descending base score, ties by ascending index.
    pub sorted_index: Vec<u32>,
    pub version: u32,
    /// Unix seconds at build time.
    pub last_modified: i64,
    /// Fingerprint of the recent history the snapshot was built from.
    pub content_hash: [u8; 32],
}

impl CacheSnapshot {
    /// Build every index from `entries`.
    pub fn build(entries: Vec<CompactEntry>, content_hash: [u8; 32], now: DateTime<Utc>) -> Self {
        let trigram_index = TrigramIndex::build(&entries);
        let sorted_index = sorted_by_score(&entries);
        Self::from_parts(entries, trigram_index, sorted_index, now.timestamp(), content_hash)
    }

    /// Assemble a snapshot from decoded sections. The trie is not persisted
    /// and is rebuilt here.
    pub fn from_parts(
        entries: Vec<CompactEntry>,
        trigram_index: TrigramIndex,
        sorted_index: Vec<u32>,
        last_modified: i64,
        content_hash: [u8; 32],
    ) -> Self {
        let prefix_trie = PrefixTrie::build(&entries);
        Self {
            entries,
            trigram_index,
            prefix_trie,
            sorted_index,
            version: SNAPSHOT_VERSION,
            last_modified,
            content_hash,
        }
    }

    pub fn empty(content_hash: [u8; 32], now: DateTime<Utc>) -> Self {
        Self::build(Vec::new(), content_hash, now)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn trigram_count(&self) -> usize {
        self.trigram_index.len()
    }

    /// Entry indices worth scoring for `query`, ascending, at most [`MAX_CANDIDATES`].
    pub fn candidates(&self, query: &str) -> Vec<u32> {
        let normalized = normalize_text(query);
        let by_trigram = self.trigram_index.candidates(&normalized);

        let mut by_prefix: Vec<u32> = Vec::new();
        for token in trie_tokens(query) {
            if is_indexable_token(&token) {
                by_prefix = union_sorted(&by_prefix, self.prefix_trie.lookup(&token));
            }
            if token.contains('.') {
                for part in dot_parts(&token) {
                    if is_indexable_token(part) {
                        by_prefix = union_sorted(&by_prefix, self.prefix_trie.lookup(part));
                    }
                }
            }
        }

        let mut merged = union_sorted(&by_trigram, &by_prefix);
        if merged.is_empty() {
            merged = (0..self.entries.len() as u32).collect();
        }
        merged.truncate(MAX_CANDIDATES);
        merged
    }

    /// URL of the highest-ranked entry whose URL starts with `prefix`, ignoring
    /// case, scheme, and a leading `www.` on both sides.
    pub fn best_prefix_match(&self, prefix: &str) -> Option<&str> {
        let wanted = prefix.trim().to_lowercase();
        let wanted = strip_scheme_and_www(&wanted);
        if wanted.is_empty() {
            return None;
        }
        self.sorted_index
            .iter()
            .filter_map(|&idx| self.entries.get(idx as usize))
            .find(|entry| {
                let url = entry.url.to_lowercase();
                strip_scheme_and_www(&url).starts_with(wanted)
            })
            .map(|entry| entry.url.as_str())
    }
}

/// Indices sorted by descending score, ties broken by ascending index.
pub fn sorted_by_score(entries: &[CompactEntry]) -> Vec<u32> {
    let mut order: Vec<u32> = (0..entries.len() as u32).collect();
    order.sort_by(|&a, &b| {
        entries[b as usize]
            .score
            .cmp(&entries[a as usize].score)
            .then(a.cmp(&b))
    });
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
    }

    fn snapshot(rows: &[(&str, &str, i64, i64)]) -> CacheSnapshot {
        let entries = rows
            .iter()
            .map(|(url, title, visits, days_ago)| {
                let visited = now() - Duration::days(*days_ago);
                CompactEntry::new_at(*url, *title, *visits, visited, now())
            })
            .collect();
        CacheSnapshot::build(entries, [0; 32], now())
    }

    #[test]
    fn sorted_index_is_by_score_then_index() {
        let snap = snapshot(&[
            ("https://old.com", "", 1, 100),
            ("https://a.com", "", 5, 0),
            ("https://b.com", "", 5, 0),
        ]);
        assert_eq!(snap.sorted_index, vec![1, 2, 0]);
        assert_eq!(snap.entry_count(), 3);
        assert_eq!(snap.version, SNAPSHOT_VERSION);
        assert_eq!(snap.last_modified, now().timestamp());
    }

    #[test]
    fn candidates_union_trigram_and_prefix_hits() {
        let snap = snapshot(&[
            ("https://github.com", "GitHub", 10, 0),
            ("https://example.org", "Example", 1, 0),
            ("https://gitlab.com", "GitLab", 3, 0),
        ]);
        assert_eq!(snap.candidates("git"), vec![0, 2]);
        assert_eq!(snap.candidates("example"), vec![1]);
    }

    #[test]
    fn candidates_fall_back_to_everything() {
        let snap = snapshot(&[("https://a.com", "", 1, 0), ("https://b.com", "", 1, 0)]);
        assert_eq!(snap.candidates("qqqqq"), vec![0, 1]);
    }

    #[test]
    fn candidates_are_capped() {
        let rows: Vec<(String, i64)> =
            (0..1500).map(|i| (format!("https://site{i}.test"), i)).collect();
        let entries = rows
            .iter()
            .map(|(url, _)| CompactEntry::new_at(url.clone(), "", 1, now(), now()))
            .collect();
        let snap = CacheSnapshot::build(entries, [0; 32], now());
        let cands = snap.candidates("site");
        assert_eq!(cands.len(), MAX_CANDIDATES);
        assert!(cands.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn best_prefix_match_follows_rank_and_ignores_scheme() {
        let snap = snapshot(&[
            ("https://github.com/old", "", 1, 60),
            ("https://www.github.com/new", "", 50, 0),
            ("http://gitlab.com", "", 100, 0),
        ]);
        assert_eq!(snap.best_prefix_match("GitHub.c"), Some("https://www.github.com/new"));
        assert_eq!(snap.best_prefix_match("https://git"), Some("http://gitlab.com"));
        assert_eq!(snap.best_prefix_match("www.github.com/o"), Some("https://github.com/old"));
        assert_eq!(snap.best_prefix_match(""), None);
        assert_eq!(snap.best_prefix_match("nomatch"), None);
    }

    #[test]
    fn empty_snapshot_has_no_candidates() {
        let snap = CacheSnapshot::empty([7; 32], now());
        assert!(snap.candidates("anything").is_empty());
        assert!(snap.sorted_index.is_empty());
        assert_eq!(snap.content_hash, [7; 32]);
    }
}
