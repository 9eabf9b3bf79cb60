//! Text normalization, tokenization, and trigram extraction.
//!
//! Every index and the scorer go through these helpers so that the text an
//! entry was indexed under and the text a query is looked up with always agree.

use smallvec::SmallVec;

/// Three consecutive Unicode scalar values.
pub type Trigram = [char; 3];

/// Token lists rarely exceed a handful of words.
pub type Tokens = SmallVec<[String; 8]>;

/// Tokens shorter than this (in chars) are not worth indexing.
pub const MIN_TOKEN_CHARS: usize = 2;

/// Lowercase, drop `https://` / `http://` / `www.`, turn every run of
/// non-alphanumeric chars into one space, trim.
pub fn normalize_text(text: &str) -> String {
    let lower = text.to_lowercase();
    let stripped = strip_url_prefixes(&lower);

    let mut out = String::with_capacity(stripped.len());
    let mut pending_space = false;
    for c in stripped.chars() {
        if c.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push(c);
        } else {
            pending_space = true;
        }
    }
    out
}

/// Same pipeline as [`normalize_text`] but keeps `.` inside tokens so host
/// names survive as one token (`github.com`). Leading/trailing dots are trimmed.
pub fn trie_tokens(text: &str) -> Tokens {
    let lower = text.to_lowercase();
    let stripped = strip_url_prefixes(&lower);

    stripped
        .split(|c: char| !(c.is_alphanumeric() || c == '.'))
        .map(|raw| raw.trim_matches('.'))
        .filter(|tok| !tok.is_empty())
        .map(str::to_string)
        .collect()
}

/// Dot-separated parts of a token (`docs.rs` -> `docs`, `rs`).
pub fn dot_parts(token: &str) -> impl Iterator<Item = &str> {
    token.split('.').filter(|part| !part.is_empty())
}

pub fn is_indexable_token(token: &str) -> bool {
    token.chars().nth(MIN_TOKEN_CHARS - 1).is_some()
}

/// Every overlapping 3-char window of `text`, in order, duplicates included.
pub fn extract_trigrams(text: &str) -> SmallVec<[Trigram; 32]> {
    let chars: SmallVec<[char; 64]> = text.chars().collect();
    chars.windows(3).map(|w| [w[0], w[1], w[2]]).collect()
}

pub fn trigram_to_string(trigram: &Trigram) -> String {
    trigram.iter().collect()
}

/// Parse a trigram key; `None` unless `s` is exactly three chars.
pub fn trigram_from_str(s: &str) -> Option<Trigram> {
    let mut chars = s.chars();
    let trigram = [chars.next()?, chars.next()?, chars.next()?];
    if chars.next().is_some() {
        return None;
    }
    Some(trigram)
}

/// Strip a leading `scheme://` and `www.` (any scheme), used for prefix completion.
pub fn strip_scheme_and_www(url: &str) -> &str {
    let is_scheme_char = |c: char| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.');
    let rest = match url.find("://") {
        Some(idx) if url[..idx].chars().all(is_scheme_char) => &url[idx + 3..],
        _ => url,
    };
    rest.strip_prefix("www.").unwrap_or(rest)
}

fn strip_url_prefixes(text: &str) -> &str {
    let text = text.strip_prefix("https://").unwrap_or(text);
    let text = text.strip_prefix("http://").unwrap_or(text);
    text.strip_prefix("www.").unwrap_or(text)
}
