//! Fuzzy name search
//!
//! Scores are partial-ratio similarities in [0, 1]: the shorter string is
//! slid across the longer one and the best `rapidfuzz` ratio of any
//! equal-length window wins. Matching is case-insensitive.

use crate::models::ScoredCandidate;
use rapidfuzz::fuzz;
use serde::{Deserialize, Serialize};

/// Top hit must reach this score...
pub const SUPER_THRESHOLD: f64 = 0.98;
/// ...and lead the runner-up by at least this much.
pub const SUPER_MARGIN: f64 = 0.10;
pub const CANDIDATE_THRESHOLD: f64 = 0.80;
pub const CANDIDATE_MAX: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit<T> {
    pub score: f64,
    pub item: T,
}

impl<T> From<SearchHit<T>> for ScoredCandidate<T> {
    fn from(hit: SearchHit<T>) -> Self {
        ScoredCandidate {
            item: hit.item,
            score: hit.score,
            match_reason: Some(format!("name similarity {:.2}", hit.score)),
        }
    }
}

/// Hits sorted by score, highest first
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResults<T> {
    hits: Vec<SearchHit<T>>,
}

impl<T: Clone> SearchResults<T> {
    pub fn new(mut hits: Vec<SearchHit<T>>) -> Self {
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        Self { hits }
    }

    pub fn hits(&self) -> &[SearchHit<T>] {
        &self.hits
    }

    pub fn into_hits(self) -> Vec<SearchHit<T>> {
        self.hits
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn best(&self) -> Option<&SearchHit<T>> {
        self.hits.first()
    }

    /// Hits at or above the candidate threshold, at most five
    pub fn candidates(&self) -> Vec<&SearchHit<T>> {
        self.hits
            .iter()
            .filter(|h| h.score >= CANDIDATE_THRESHOLD)
            .take(CANDIDATE_MAX)
            .collect()
    }

    /// Top hit when it is unambiguous
    pub fn super_match(&self) -> Option<&SearchHit<T>> {
        let top = self.hits.first()?;
        if top.score < SUPER_THRESHOLD {
            return None;
        }
        match self.hits.get(1) {
            Some(second) if top.score - second.score < SUPER_MARGIN => None,
            _ => Some(top),
        }
    }
}

/// Items paired with the text they are searched by
pub struct SearchableList<T> {
    items: Vec<T>,
    texts: Vec<String>,
}

impl<T: Clone> SearchableList<T> {
    pub fn new<F>(items: Vec<T>, key: F) -> Self
    where
        F: Fn(&T) -> String,
    {
        let texts = items.iter().map(|it| key(it).to_lowercase()).collect();
        Self { items, texts }
    }

    pub fn search(&self, query: &str) -> SearchResults<T> {
        let query = query.trim().to_lowercase();
        let hits = self
            .items
            .iter()
            .zip(&self.texts)
            .map(|(item, text)| SearchHit {
                score: round4(partial_ratio(&query, text)),
                item: item.clone(),
            })
            .collect();
        SearchResults::new(hits)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

/// Best window similarity of the shorter string against the longer one.
pub fn partial_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };

    if short.is_empty() {
        return 0.0;
    }

    let window = short.len();
    (0..=long.len() - window)
        .map(|start| ratio(&short, &long[start..start + window]))
        .fold(0.0, f64::max)
}

/// Normalized indel similarity in [0, 1]
pub fn ratio(a: &[char], b: &[char]) -> f64 {
    fuzz::ratio(a.iter().copied(), b.iter().copied())
}
