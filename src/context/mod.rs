use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::CouncilResult;
use crate::history::HistoryEntry;
use crate::store::{select_within_budget, DocumentStore, ScoredResult};
use crate::types::Message;

fn default_history_cap() -> usize {
    20
}

fn default_recent_tail() -> usize {
    3
}

/// History window settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Entries kept before the window starts trimming
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
    /// Newest entries moved next to the request once the cap is exceeded
    #[serde(default = "default_recent_tail")]
    pub recent_tail: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            history_cap: default_history_cap(),
            recent_tail: default_recent_tail(),
        }
    }
}

/// History split into the leading window and the tail placed before the request
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryWindow {
    pub leading: Vec<HistoryEntry>,
    pub recent: Vec<HistoryEntry>,
}

impl ContextConfig {
    /// Below the cap everything leads. Above it, the oldest `cap - tail`
    /// entries lead and the newest `tail` entries are held back.
    pub fn window(&self, history: &[HistoryEntry]) -> HistoryWindow {
        if history.len() <= self.history_cap {
            return HistoryWindow {
                leading: history.to_vec(),
                recent: Vec::new(),
            };
        }
        let tail = self.recent_tail.min(self.history_cap);
        let lead = self.history_cap - tail;
        HistoryWindow {
            leading: history[..lead].to_vec(),
            recent: history[history.len() - tail..].to_vec(),
        }
    }
}

/// Inputs for one assembled request
pub struct ContextRequest<'a> {
    /// Primary store first, then read-only auxiliary stores
    pub stores: &'a [Arc<DocumentStore>],
    pub persona: &'a [String],
    pub request: &'a [Message],
    /// Text used for retrieval, usually the live query
    pub query: &'a str,
    pub include_file_listing: bool,
}

/// Builds the exact message list sent for one turn:
/// history, grounding, file listing, persona, recent history, request
pub struct ContextAssembler {
    config: ContextConfig,
    token_budget: usize,
}

impl ContextAssembler {
    pub fn new(config: ContextConfig, token_budget: usize) -> Self {
        Self {
            config,
            token_budget,
        }
    }

    pub async fn assemble(
        &self,
        history: &[HistoryEntry],
        request: ContextRequest<'_>,
        cancel: &CancellationToken,
    ) -> CouncilResult<Vec<Message>> {
        let window = self.config.window(history);
        let mut messages: Vec<Message> = window.leading.iter().map(|e| e.to_message()).collect();

        let grounding = self.grounding(request.stores, request.query, cancel).await?;
        if !grounding.is_empty() {
            messages.push(Message::system(render_grounding(&grounding)));
        }

        if request.include_file_listing {
            if let Some(primary) = request.stores.first() {
                let files = primary.list("", true).await?;
                messages.push(Message::system(render_listing(primary.name(), &files)));
            }
        }

        messages.extend(request.persona.iter().map(Message::system));
        messages.extend(window.recent.iter().map(|e| e.to_message()));
        messages.extend(request.request.iter().cloned());

        tracing::debug!(
            history = window.leading.len() + window.recent.len(),
            grounding = grounding.len(),
            messages = messages.len(),
            "context assembled"
        );
        Ok(messages)
    }

    /// Candidates from every store, re-ranked together under one budget
    async fn grounding(
        &self,
        stores: &[Arc<DocumentStore>],
        query: &str,
        cancel: &CancellationToken,
    ) -> CouncilResult<Vec<(String, ScoredResult)>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let mut candidates: Vec<ScoredResult> = Vec::new();
        let mut origins: Vec<String> = Vec::new();
        for store in stores {
            for hit in store.embeddings(query, cancel).await? {
                origins.push(store.name().to_string());
                candidates.push(ScoredResult {
                    // tag with the store index so equal keys stay distinct
                    key: format!("{}\u{0}{}", origins.len() - 1, hit.key),
                    ..hit
                });
            }
        }

        Ok(select_within_budget(candidates, self.token_budget)
            .into_iter()
            .filter_map(|mut hit| {
                let (index, key) = hit.key.split_once('\u{0}')?;
                let origin = origins.get(index.parse::<usize>().ok()?)?.clone();
                hit.key = key.to_string();
                Some((origin, hit))
            })
            .collect())
    }
}

fn render_grounding(hits: &[(String, ScoredResult)]) -> String {
    let mut out = String::from("Relevant documents from the knowledge stores:\n");
    for (store, hit) in hits {
        let source = hit.parent.as_deref().unwrap_or(&hit.key);
        out.push_str(&format!(
            "\n--- {store}: {source} ({}, score {:.3}) ---\n{}\n",
            hit.key,
            hit.score,
            hit.text.as_deref().unwrap_or_default()
        ));
    }
    out
}

fn render_listing(store: &str, files: &[String]) -> String {
    if files.is_empty() {
        return format!("The store '{store}' contains no files yet.");
    }
    let mut out = format!("Files in store '{store}':\n");
    for file in files {
        out.push_str(&format!("- {file}\n"));
    }
    out
}
