use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{EmbeddingRecord, VectorSearch};
use crate::types::estimate_tokens;

fn default_token_budget() -> usize {
    2000
}

fn default_top_k() -> usize {
    20
}

fn default_min_similarity() -> f32 {
    0.3
}

fn default_max_query_chars() -> usize {
    8000
}

/// Retrieval tuning shared by every store
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Approximate token budget for the selected grounding text
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    /// Native vector search only
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Native vector search only
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
    #[serde(default = "default_max_query_chars")]
    pub max_query_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            top_k: default_top_k(),
            min_similarity: default_min_similarity(),
            max_query_chars: default_max_query_chars(),
        }
    }
}

/// A ranked retrieval hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredResult {
    pub key: String,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ScoredResult {
    pub fn new(key: impl Into<String>, score: f32) -> Self {
        Self {
            key: key.into(),
            score,
            parent: None,
            text: None,
        }
    }

    pub fn tokens(&self) -> usize {
        self.text.as_deref().map(estimate_tokens).unwrap_or(0)
    }
}

/// How a store answers similarity queries, fixed when the store is built
#[derive(Clone)]
pub enum SearchStrategy {
    /// Score every stored embedding in memory
    Scan,
    /// Delegate to the backend's own vector index
    Native(Arc<dyn VectorSearch>),
}

impl SearchStrategy {
    pub fn is_native(&self) -> bool {
        matches!(self, SearchStrategy::Native(_))
    }
}

impl std::fmt::Debug for SearchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearchStrategy::Scan => write!(f, "Scan"),
            SearchStrategy::Native(_) => write!(f, "Native"),
        }
    }
}

/// Cosine similarity; zero for empty or zero-magnitude vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let len = a.len().min(b.len());
    let dot: f32 = a[..len].iter().zip(&b[..len]).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}

/// Score every record against the query, best first
pub fn scan(query: &[f32], records: &[EmbeddingRecord]) -> Vec<ScoredResult> {
    let mut scored: Vec<ScoredResult> = records
        .iter()
        .map(|r| ScoredResult::new(&r.key, cosine_similarity(query, &r.vector)))
        .collect();
    sort_descending(&mut scored);
    scored
}

pub fn sort_descending(results: &mut [ScoredResult]) {
    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
}

/// Walk results best-first, keeping whole items while they fit the budget.
/// The first item that would overflow ends the selection.
pub fn select_within_budget(mut results: Vec<ScoredResult>, budget: usize) -> Vec<ScoredResult> {
    sort_descending(&mut results);
    let mut used = 0;
    let mut selected = Vec::new();
    for result in results {
        let tokens = result.tokens();
        if used + tokens > budget {
            break;
        }
        used += tokens;
        selected.push(result);
    }
    selected
}

/// Cut a query down to at most `max_chars` characters
pub fn truncate_query(query: &str, max_chars: usize) -> &str {
    match query.char_indices().nth(max_chars) {
        Some((idx, _)) => &query[..idx],
        None => query,
    }
}
