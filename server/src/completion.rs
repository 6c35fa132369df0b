//! Link completion over the ids held in the q-gram index.
//!
//! The last word of the context is matched first, then the last two words,
//! and so on, which lets `Albert Ein` complete to `Albert Einstein`. Growing
//! stops at the first suffix that shares no gram with anything indexed: a
//! longer phrase ending in a word that matched nothing is assumed to be
//! junk (so `Midgard z` does not complete to `Midgard`).

use serde::Serialize;

use crate::qgram::{Match, QGramIndex};

/// Matches at or below this score are discarded.
pub const MIN_SCORE: f32 = 0.3;

#[derive(Debug, Clone, PartialEq)]
pub struct Suggestion {
    pub found: Match,
    pub num_words_used: usize,
    pub phrase: String,
    /// Byte offset in the context where the consumed words begin.
    pub start: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    pub offset: usize,
    pub value: String,
    pub name: String,
    pub replaces: String,
}

/// Whitespace separated words with their byte offsets.
fn words(context: &str) -> Vec<(usize, &str)> {
    let mut out = Vec::new();
    let mut start = None;
    for (i, c) in context.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                out.push((s, &context[s..i]));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        out.push((s, &context[s..]));
    }
    out
}

/// Candidate suggestions for `context`, best score first.
pub fn suggest(index: &QGramIndex, context: &str) -> Vec<Suggestion> {
    let words = words(context);
    let mut results = Vec::new();
    for used in 1..=words.len() {
        let tail = &words[words.len() - used..];
        let phrase = tail.iter().map(|(_, w)| *w).collect::<Vec<_>>().join(" ");
        let hits = index.query(&phrase);
        if hits.is_empty() {
            break;
        }
        let start = tail[0].0;
        results.extend(hits.into_iter().filter(|m| m.score > MIN_SCORE).map(|found| Suggestion {
            found,
            num_words_used: used,
            phrase: phrase.clone(),
            start,
        }));
    }
    results.sort_by(|a, b| b.found.score.partial_cmp(&a.found.score).unwrap_or(std::cmp::Ordering::Equal));
    results
}

/// Editor-facing completions: each one rewrites the context, replacing the
/// consumed words by a markdown link to the matched entry.
pub fn complete(index: &QGramIndex, context: &str) -> Vec<Completion> {
    suggest(index, context)
        .into_iter()
        .map(|s| {
            let prefix = &context[..s.start];
            Completion {
                offset: s.found.value.len(),
                value: format!("{}[{}]({})", prefix, s.found.value, s.found.value),
                name: s.found.value.clone(),
                replaces: format!("{} {}", s.phrase, s.found.score),
            }
        })
        .collect()
}
