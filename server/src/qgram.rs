//! Q-gram similarity index used for link autocompletion.
//!
//! Strings are lowercased, padded in front with `Q - 1` copies of
//! [`PAD`] and cut into overlapping windows of `Q` characters. Padding only
//! the front favours prefixes, which is what a half-typed link looks like,
//! and guarantees that any non-empty string yields at least one gram.
//! Similarity is the Jaccard ratio of the two gram sets.

use std::collections::{HashMap, HashSet};

pub const Q: usize = 3;
pub const PAD: char = '$';

#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub key: String,
    pub value: String,
    pub score: f32,
}

#[derive(Debug, Clone)]
struct Indexed {
    value: String,
    grams: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct QGramIndex {
    entries: HashMap<String, Indexed>,
    postings: HashMap<String, HashSet<String>>,
}

pub fn grams(text: &str) -> HashSet<String> {
    let chars: Vec<char> = text.to_lowercase().chars().collect();
    if chars.is_empty() {
        return HashSet::new();
    }
    let padded: Vec<char> = std::iter::repeat(PAD).take(Q - 1).chain(chars).collect();
    padded.windows(Q).map(|w| w.iter().collect()).collect()
}

impl QGramIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Indexes `value` under `key`, replacing whatever `key` held before.
    pub fn add(&mut self, key: &str, value: &str) {
        if let Some(existing) = self.entries.get(key) {
            if existing.value == value {
                return;
            }
            self.remove(key);
        }
        let grams = grams(value);
        for g in &grams {
            self.postings.entry(g.clone()).or_default().insert(key.to_string());
        }
        self.entries.insert(key.to_string(), Indexed { value: value.to_string(), grams });
    }

    pub fn remove(&mut self, key: &str) {
        let Some(indexed) = self.entries.remove(key) else { return };
        for g in &indexed.grams {
            if let Some(keys) = self.postings.get_mut(g) {
                keys.remove(key);
                if keys.is_empty() {
                    self.postings.remove(g);
                }
            }
        }
    }

    /// Every indexed value sharing at least one gram with `text`, scored in
    /// `(0, 1]`. The order of the result is unspecified.
    pub fn query(&self, text: &str) -> Vec<Match> {
        let query_grams = grams(text);
        let mut shared: HashMap<&str, usize> = HashMap::new();
        for g in &query_grams {
            if let Some(keys) = self.postings.get(g) {
                for k in keys {
                    *shared.entry(k.as_str()).or_insert(0) += 1;
                }
            }
        }
        shared
            .into_iter()
            .filter_map(|(key, inter)| {
                let indexed = self.entries.get(key)?;
                let union = query_grams.len() + indexed.grams.len() - inter;
                Some(Match { key: key.to_string(), value: indexed.value.clone(), score: inter as f32 / union as f32 })
            })
            .collect()
    }
}
