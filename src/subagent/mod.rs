use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::{CouncilError, CouncilResult};
use crate::provider::LlmClient;
use crate::types::*;

/// Subagent configuration
#[derive(Debug, Clone)]
pub struct SubagentConfig {
    pub name: String,
    pub system_prompt: String,
    pub format: ResponseFormat,
}

impl SubagentConfig {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            format: ResponseFormat::Text,
        }
    }
}

/// Subagent role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubagentRole {
    /// Works a delegated task on its own
    Delegate,
    /// Condenses text for a caller
    Summarizer,
    General,
}

/// Result from a subagent execution
#[derive(Debug, Clone)]
pub struct SubagentResult {
    pub role: SubagentRole,
    pub name: String,
    pub content: String,
}

/// Runs single-turn subagents: no tools, no history, no store
pub struct SubagentSpawner {
    client: Arc<dyn LlmClient>,
}

impl SubagentSpawner {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }

    /// Spawn a stateless subagent and wait for its single answer
    pub async fn spawn_stateless(
        &self,
        config: &SubagentConfig,
        messages: Vec<Message>,
        cancel: &CancellationToken,
    ) -> CouncilResult<SubagentResult> {
        let mut request = Vec::with_capacity(messages.len() + 1);
        if !config.system_prompt.is_empty() {
            request.push(Message::system(&config.system_prompt));
        }
        request.extend(messages);

        tracing::debug!(subagent = %config.name, messages = request.len(), "subagent started");
        let completion = tokio::select! {
            _ = cancel.cancelled() => return Err(CouncilError::Interrupted),
            result = self.client.chat_complete(&request, &[], config.format, cancel) => result?,
        };

        match completion.finish_reason {
            FinishReason::Stop => Ok(SubagentResult {
                role: SubagentRole::General,
                name: config.name.clone(),
                content: completion.message.text_content(),
            }),
            other => Err(CouncilError::UnsupportedFinishReason {
                reason: other.to_string(),
            }),
        }
    }

    /// Hand a self-contained task to a subagent
    pub async fn delegate(
        &self,
        config: &SubagentConfig,
        task: &str,
        context: Option<&str>,
        cancel: &CancellationToken,
    ) -> CouncilResult<SubagentResult> {
        let prompt = match context {
            Some(context) if !context.trim().is_empty() => {
                format!("Task:\n{task}\n\nContext:\n{context}")
            }
            _ => format!("Task:\n{task}"),
        };

        let mut result = self
            .spawn_stateless(config, vec![Message::user(prompt)], cancel)
            .await?;
        result.role = SubagentRole::Delegate;
        Ok(result)
    }

    /// Summarize messages, keeping decisions, touched documents and open work
    pub async fn summarize(
        &self,
        config: &SubagentConfig,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> CouncilResult<SubagentResult> {
        let transcript: Vec<String> = messages
            .iter()
            .map(|m| format!("[{}] {}", m.role, m.text_content()))
            .collect();

        let prompt = format!(
            "Summarize this conversation. Keep key decisions, documents changed and the current state of the task.\n\n{}",
            transcript.join("\n\n")
        );

        let mut result = self
            .spawn_stateless(config, vec![Message::user(prompt)], cancel)
            .await?;
        result.role = SubagentRole::Summarizer;
        Ok(result)
    }
}
