//! Multi-signal fuzzy scoring.
//!
//! Each candidate gets a URL and a title similarity (substring, Jaro-Winkler,
//! or tokenized, picked by query length), blended with recency and visit
//! signals using the configured weights.

use std::cmp::Ordering;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rayon::prelude::*;
use serde::Serialize;
use smallvec::SmallVec;

use super::index::CacheSnapshot;
use super::normalize::normalize_text;
use crate::config::CacheConfig;
use crate::model::types::CompactEntry;

/// Below this many candidates rayon's fork/join costs more than it saves.
const PARALLEL_THRESHOLD: usize = 256;

/// Set HFC_PARALLEL_SCORING=0 to force sequential scoring.
static PARALLEL_SCORING_ENABLED: Lazy<bool> = Lazy::new(|| {
    dotenvy::var("HFC_PARALLEL_SCORING")
        .map(|v| v != "0" && v.to_lowercase() != "false")
        .unwrap_or(true)
});

const CONTAINS_BOOST: f64 = 0.95;
const PREFIX_BOOST: f64 = 0.9;
const FUZZY_TYPE_THRESHOLD: f64 = 0.7;
const TOKEN_MATCH_THRESHOLD: f64 = 0.6;
const RECENCY_DECAY_DAYS: f64 = 30.0;
const VISIT_SATURATION: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    /// Query contained in the URL or title.
    Exact,
    /// Query starts the URL or title.
    Prefix,
    /// Strong similarity without containment.
    Fuzzy,
    /// Weak similarity; the entry only surfaced through the indexes.
    Trigram,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FuzzyMatch {
    pub entry_index: u32,
    pub entry: CompactEntry,
    pub score: f64,
    pub url_score: f64,
    pub title_score: f64,
    pub recency_score: f64,
    pub visit_score: f64,
    pub match_type: MatchType,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FuzzyResult {
    pub matches: Vec<FuzzyMatch>,
    pub query_time: Duration,
}

/// Scores snapshot entries against queries with a fixed set of weights.
#[derive(Debug, Clone)]
pub struct FuzzyScorer {
    url_weight: f64,
    title_weight: f64,
    recency_weight: f64,
    visit_weight: f64,
    score_threshold: f64,
    max_results: usize,
}

impl FuzzyScorer {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            url_weight: config.url_weight,
            title_weight: config.title_weight,
            recency_weight: config.recency_weight,
            visit_weight: config.visit_weight,
            score_threshold: config.score_threshold,
            max_results: config.max_results,
        }
    }

    /// Rank `snapshot` entries for `query`. A query that normalizes to nothing
    /// returns [`FuzzyScorer::top_entries`].
    pub fn search(&self, snapshot: &CacheSnapshot, query: &str, now: DateTime<Utc>) -> FuzzyResult {
        let started = Instant::now();
        let normalized = normalize_text(query);
        if normalized.is_empty() {
            return self.top_entries(snapshot);
        }

        let candidates = snapshot.candidates(query);
        let score_one = |&idx: &u32| {
            snapshot
                .entries
                .get(idx as usize)
                .map(|entry| self.score_entry(&normalized, idx, entry, now))
        };

        let parallel = *PARALLEL_SCORING_ENABLED && candidates.len() >= PARALLEL_THRESHOLD;
        let scored: Vec<FuzzyMatch> = if parallel {
            candidates.par_iter().filter_map(score_one).collect()
        } else {
            candidates.iter().filter_map(score_one).collect()
        };

        let mut matches: Vec<FuzzyMatch> = scored
            .into_iter()
            .filter(|m| m.score >= self.score_threshold)
            .collect();
        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then(a.entry_index.cmp(&b.entry_index))
        });
        matches.truncate(self.max_results);

        tracing::debug!(
            query,
            candidates = candidates.len(),
            matches = matches.len(),
            "fuzzy_search"
        );
        FuzzyResult {
            matches,
            query_time: started.elapsed(),
        }
    }

    /// Highest base-score entries, unscored.
    pub fn top_entries(&self, snapshot: &CacheSnapshot) -> FuzzyResult {
        let started = Instant::now();
        let matches = snapshot
            .sorted_index
            .iter()
            .take(self.max_results)
            .filter_map(|&idx| {
                let entry = snapshot.entries.get(idx as usize)?;
                Some(FuzzyMatch {
                    entry_index: idx,
                    entry: entry.clone(),
                    score: f64::from(entry.score) / f64::from(u16::MAX),
                    url_score: 0.0,
                    title_score: 0.0,
                    recency_score: 1.0,
                    visit_score: 1.0,
                    match_type: MatchType::Exact,
                })
            })
            .collect();
        FuzzyResult {
            matches,
            query_time: started.elapsed(),
        }
    }

    /// Score one entry against an already normalized query.
    pub fn score_entry(
        &self,
        normalized_query: &str,
        entry_index: u32,
        entry: &CompactEntry,
        now: DateTime<Utc>,
    ) -> FuzzyMatch {
        let url = normalize_text(&entry.url);
        let title = normalize_text(&entry.title);

        let mut url_score = text_similarity(normalized_query, &url);
        let mut title_score = text_similarity(normalized_query, &title);
        let mut match_type = None;

        if url.contains(normalized_query) {
            url_score = url_score.max(CONTAINS_BOOST);
            match_type = Some(MatchType::Exact);
        }
        if title.contains(normalized_query) {
            title_score = title_score.max(CONTAINS_BOOST);
            match_type = Some(MatchType::Exact);
        }
        if url.starts_with(normalized_query) {
            url_score = url_score.max(PREFIX_BOOST);
            match_type.get_or_insert(MatchType::Prefix);
        }
        if title.starts_with(normalized_query) {
            title_score = title_score.max(PREFIX_BOOST);
            match_type.get_or_insert(MatchType::Prefix);
        }

        let match_type = match_type.unwrap_or(
            if url_score > FUZZY_TYPE_THRESHOLD || title_score > FUZZY_TYPE_THRESHOLD {
                MatchType::Fuzzy
            } else {
                MatchType::Trigram
            },
        );

        let recency_score = recency_score(entry.days_since_visit(now));
        let visit_score = visit_score(entry.visit_count);
        let score = (self.url_weight * url_score
            + self.title_weight * title_score
            + self.recency_weight * recency_score
            + self.visit_weight * visit_score)
            .clamp(0.0, 1.0);

        FuzzyMatch {
            entry_index,
            entry: entry.clone(),
            score,
            url_score,
            title_score,
            recency_score,
            visit_score,
            match_type,
        }
    }
}

/// Similarity of two normalized strings, in `[0, 1]`.
pub fn text_similarity(query: &str, text: &str) -> f64 {
    if query == text {
        return 1.0;
    }
    if query.is_empty() || text.is_empty() {
        return 0.0;
    }
    match query.chars().count() {
        0..=3 => substring_similarity(query, text),
        4..=10 => jaro_winkler(query, text),
        _ => tokenized_similarity(query, text),
    }
}

/// `len(q)/len(t)` boosted by where `query` first occurs in `text`; 0 when absent.
pub fn substring_similarity(query: &str, text: &str) -> f64 {
    let Some(byte_pos) = text.find(query) else {
        return 0.0;
    };
    if query.is_empty() {
        return 0.0;
    }
    let text_len = text.chars().count();
    let position = text[..byte_pos].chars().count();
    let base = query.chars().count() as f64 / text_len as f64;
    let bonus = if position == 0 {
        1.5
    } else if position < text_len / 3 {
        1.2
    } else {
        1.0
    };
    (base * bonus).min(1.0)
}

/// Jaro-Winkler similarity over Unicode scalar values.
pub fn jaro_winkler(s1: &str, s2: &str) -> f64 {
    if s1 == s2 {
        return 1.0;
    }
    let a: SmallVec<[char; 32]> = s1.chars().collect();
    let b: SmallVec<[char; 32]> = s2.chars().collect();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let window = (a.len().max(b.len()) / 2).saturating_sub(1);
    let mut matched_a: SmallVec<[bool; 32]> = SmallVec::from_elem(false, a.len());
    let mut matched_b: SmallVec<[bool; 32]> = SmallVec::from_elem(false, b.len());
    let mut matches = 0usize;

    for (i, &ca) in a.iter().enumerate() {
        let start = i.saturating_sub(window);
        let end = (i + window + 1).min(b.len());
        for j in start..end {
            if !matched_b[j] && b[j] == ca {
                matched_a[i] = true;
                matched_b[j] = true;
                matches += 1;
                break;
            }
        }
    }
    if matches == 0 {
        return 0.0;
    }

    let mut transpositions = 0usize;
    let mut k = 0usize;
    for (i, &ca) in a.iter().enumerate() {
        if !matched_a[i] {
            continue;
        }
        while !matched_b[k] {
            k += 1;
        }
        if ca != b[k] {
            transpositions += 1;
        }
        k += 1;
    }

    let m = matches as f64;
    let half_transpositions = (transpositions / 2) as f64;
    let jaro = (m / a.len() as f64 + m / b.len() as f64 + (m - half_transpositions) / m) / 3.0;
    if jaro < 0.7 {
        return jaro;
    }

    let prefix = a
        .iter()
        .zip(b.iter())
        .take(4)
        .take_while(|(x, y)| x == y)
        .count();
    jaro + 0.1 * prefix as f64 * (1.0 - jaro)
}

/// Per query token, the best Jaro-Winkler against any text token. Tokens whose
/// best reaches 0.6 count; the mean of those is scaled by the matched share.
pub fn tokenized_similarity(query: &str, text: &str) -> f64 {
    let query_tokens: SmallVec<[&str; 8]> = query.split_whitespace().collect();
    let text_tokens: SmallVec<[&str; 16]> = text.split_whitespace().collect();
    if query_tokens.is_empty() || text_tokens.is_empty() {
        return 0.0;
    }

    let mut total = 0.0;
    let mut matched = 0usize;
    for q in &query_tokens {
        let best = text_tokens
            .iter()
            .map(|t| jaro_winkler(q, t))
            .fold(0.0_f64, f64::max);
        if best >= TOKEN_MATCH_THRESHOLD {
            total += best;
            matched += 1;
        }
    }
    if matched == 0 {
        return 0.0;
    }
    (total / matched as f64) * (matched as f64 / query_tokens.len() as f64)
}

/// `exp(-days/30)`.
pub fn recency_score(days_since: f64) -> f64 {
    (-days_since.max(0.0) / RECENCY_DECAY_DAYS).exp()
}

/// `ln(1 + visits) / ln(1001)`, capped at 1.
pub fn visit_score(visit_count: u16) -> f64 {
    if visit_count == 0 {
        return 0.0;
    }
    (f64::from(visit_count).ln_1p() / VISIT_SATURATION.ln_1p()).min(1.0)
}
