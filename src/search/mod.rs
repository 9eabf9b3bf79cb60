//! Search layer: normalization, the trigram and prefix indexes, the immutable
//! snapshot that bundles them, and fuzzy scoring.

pub mod fuzzy;
pub mod index;
pub mod normalize;
pub mod trie;
pub mod trigram;

pub use fuzzy::{FuzzyMatch, FuzzyResult, FuzzyScorer, MatchType};
pub use index::{CacheSnapshot, MAX_CANDIDATES};
