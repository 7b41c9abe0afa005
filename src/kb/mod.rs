//! Knowledge-base lookup: maps a ticket summary to a canned solution.

mod migrations;
pub mod store;

pub use store::LibSqlKnowledgeBase;

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::KbError;

/// Returned when no entry shares any terms with the query.
pub const NO_MATCH_SOLUTION: &str = "Sorry, we couldn't find a solution in our knowledge base. \
     Please contact support for further assistance.";

/// Returned to the customer when the knowledge base itself fails.
pub const UNAVAILABLE_SOLUTION: &str =
    "Our knowledge base is temporarily unavailable. Please try again later.";

/// Query text in, solution text out.
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    async fn lookup(&self, query: &str) -> Result<String, KbError>;
}

/// One question/answer pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KbEntry {
    pub question: String,
    pub answer: String,
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "can", "do", "for", "from", "have",
    "i", "if", "in", "is", "it", "me", "my", "not", "of", "on", "or", "our", "so", "that", "the",
    "this", "to", "was", "we", "what", "with", "you", "your",
];

/// Lowercased content words of `text`.
fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 1)
        .map(str::to_lowercase)
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// Set-cosine similarity between two term sets.
fn similarity(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count() as f64;
    shared / ((a.len() * b.len()) as f64).sqrt()
}

/// Best-scoring entry for `query`, or `None` when nothing overlaps.
/// Ties go to the earliest entry.
pub fn best_match<'a>(query: &str, entries: &'a [KbEntry]) -> Option<&'a KbEntry> {
    let query_terms = terms(query);
    let mut best: Option<(&KbEntry, f64)> = None;
    for entry in entries {
        let score = similarity(&query_terms, &terms(&entry.question));
        if score > 0.0 && best.is_none_or(|(_, top)| score > top) {
            best = Some((entry, score));
        }
    }
    best.map(|(entry, _)| entry)
}
