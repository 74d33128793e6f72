use futures::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{CouncilError, CouncilResult};
use crate::types::*;

/// Reference to a generated image: a URL or an inline base64 payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageRef {
    Url { url: String },
    Base64 { data: String },
}

/// Stream of events for one streamed round
pub type EventStream = BoxStream<'static, CouncilResult<StreamEvent>>;

/// Core client trait: abstracts the LLM vendor behind four operations
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    /// Short identifier used in logs
    fn name(&self) -> &str;

    /// Send the full message list plus declared tools, wait for the whole response
    async fn chat_complete(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        format: ResponseFormat,
        cancel: &CancellationToken,
    ) -> CouncilResult<ChatCompletion>;

    /// Streamed completion. The finish reason arrives as the last event of
    /// the round. The default implementation replays `chat_complete`.
    async fn chat_complete_streaming(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        format: ResponseFormat,
        cancel: &CancellationToken,
    ) -> CouncilResult<EventStream> {
        let completion = self.chat_complete(messages, tools, format, cancel).await?;
        Ok(Box::pin(stream::iter(
            completion_events(completion).into_iter().map(Ok),
        )))
    }

    async fn generate_embedding(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> CouncilResult<Vec<f32>>;

    async fn generate_image(
        &self,
        _prompt: &str,
        _cancel: &CancellationToken,
    ) -> CouncilResult<ImageRef> {
        Err(CouncilError::Provider(format!(
            "{} does not support image generation",
            self.name()
        )))
    }
}

/// Flatten a finished completion into the events a stream would have produced
pub fn completion_events(completion: ChatCompletion) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    let text = completion
        .message
        .content
        .iter()
        .filter_map(|c| match c {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<String>();
    if !text.is_empty() {
        events.push(StreamEvent::TextDelta { text });
    }
    for call in completion.message.tool_calls() {
        events.push(StreamEvent::ToolCallDelta {
            id: Some(call.id),
            name: Some(call.name),
            arguments: call.arguments.to_string(),
        });
    }
    events.push(StreamEvent::Finish {
        reason: completion.finish_reason,
    });
    events
}
