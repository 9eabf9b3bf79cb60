//! Trigram posting lists over normalized URL + title text.

use fxhash::FxHashMap;

use super::normalize::{Trigram, extract_trigrams, normalize_text};
use crate::model::types::CompactEntry;

/// Trigram -> ascending, deduplicated entry indices.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TrigramIndex {
    postings: FxHashMap<Trigram, Vec<u32>>,
}

impl TrigramIndex {
    /// Index every entry under the trigrams of `normalize(url + " " + title)`.
    pub fn build(entries: &[CompactEntry]) -> Self {
        let mut postings: FxHashMap<Trigram, Vec<u32>> = FxHashMap::default();
        for (idx, entry) in entries.iter().enumerate() {
            let text = normalize_text(&format!("{} {}", entry.url, entry.title));
            for trigram in extract_trigrams(&text) {
                let ids = postings.entry(trigram).or_default();
                // Entries are visited in order, so only the tail can repeat.
                if ids.last() != Some(&(idx as u32)) {
                    ids.push(idx as u32);
                }
            }
        }
        Self { postings }
    }

    /// Rebuild from decoded postings. Each list is sorted and deduplicated.
    pub fn from_postings(postings: FxHashMap<Trigram, Vec<u32>>) -> Self {
        let postings = postings
            .into_iter()
            .map(|(k, mut ids)| {
                ids.sort_unstable();
                ids.dedup();
                (k, ids)
            })
            .collect();
        Self { postings }
    }

    pub fn get(&self, trigram: &Trigram) -> &[u32] {
        self.postings.get(trigram).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.postings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.postings.is_empty()
    }

    /// Postings in ascending key order, the order they are written to disk.
    pub fn sorted_postings(&self) -> Vec<(&Trigram, &Vec<u32>)> {
        let mut items: Vec<_> = self.postings.iter().collect();
        items.sort_unstable_by(|a, b| a.0.cmp(b.0));
        items
    }

    /// Entries containing every known trigram of the normalized query.
    ///
    /// Trigrams nobody has are skipped rather than emptying the result; an
    /// empty intersection short-circuits.
    pub fn candidates(&self, normalized_query: &str) -> Vec<u32> {
        let mut acc: Option<Vec<u32>> = None;
        for trigram in extract_trigrams(normalized_query) {
            let ids = self.get(&trigram);
            if ids.is_empty() {
                continue;
            }
            acc = Some(match acc {
                None => ids.to_vec(),
                Some(current) => intersect_sorted(&current, ids),
            });
            if acc.as_ref().is_some_and(Vec::is_empty) {
                return Vec::new();
            }
        }
        acc.unwrap_or_default()
    }
}

/// Merge-intersect two ascending slices.
pub fn intersect_sorted(a: &[u32], b: &[u32]) -> Vec<u32> {
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

/// Merge-union two ascending slices without duplicates.
pub fn union_sorted(a: &[u32], b: &[u32]) -> Vec<u32> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}
