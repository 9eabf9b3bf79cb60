//! Prefix trie over word tokens. Nodes live in one arena `Vec`.

use fxhash::FxHashMap;

use super::normalize::{dot_parts, is_indexable_token, trie_tokens};
use crate::model::types::CompactEntry;

#[derive(Debug, Default, Clone)]
struct TrieNode {
    children: FxHashMap<char, u32>,
    /// Ascending entry indices of every token passing through this node.
    entries: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct PrefixTrie {
    nodes: Vec<TrieNode>,
}

impl Default for PrefixTrie {
    fn default() -> Self {
        Self {
            nodes: vec![TrieNode::default()],
        }
    }
}

impl PrefixTrie {
    pub fn build(entries: &[CompactEntry]) -> Self {
        let mut trie = Self::default();
        for (idx, entry) in entries.iter().enumerate() {
            let idx = idx as u32;
            for text in [&entry.url, &entry.title] {
                for token in trie_tokens(text) {
                    if is_indexable_token(&token) {
                        trie.insert(&token, idx);
                    }
                    if token.contains('.') {
                        for part in dot_parts(&token) {
                            if is_indexable_token(part) {
                                trie.insert(part, idx);
                            }
                        }
                    }
                }
            }
        }
        trie
    }

    /// Record `entry` on every node along `word`.
    ///
    /// Entries must be inserted in non-decreasing index order; that keeps each
    /// node's list sorted with a tail check instead of a search.
    pub fn insert(&mut self, word: &str, entry: u32) {
        let mut current = 0usize;
        for c in word.chars() {
            let next = match self.nodes[current].children.get(&c) {
                Some(&child) => child as usize,
                None => {
                    let child = self.nodes.len();
                    self.nodes.push(TrieNode::default());
                    self.nodes[current].children.insert(c, child as u32);
                    child
                }
            };
            current = next;
            let list = &mut self.nodes[current].entries;
            if list.last() != Some(&entry) {
                list.push(entry);
            }
        }
    }

    /// Entries stored at the node reached by `prefix`; empty when the path is absent.
    pub fn lookup(&self, prefix: &str) -> &[u32] {
        if prefix.is_empty() {
            return &[];
        }
        let mut current = 0usize;
        for c in prefix.chars() {
            match self.nodes[current].children.get(&c) {
                Some(&child) => current = child as usize,
                None => return &[],
            }
        }
        &self.nodes[current].entries
    }

    /// Number of nodes, root included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}
