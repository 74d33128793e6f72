use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::error::{CouncilError, CouncilResult};
use crate::types::*;

use super::traits::{EventStream, ImageRef, LlmClient};

/// Client for OpenAI-compatible chat, embedding and image endpoints
pub struct OpenAIClient {
    client: Client,
    base_url: String,
    api_key: String,
    chat_model: String,
    embedding_model: String,
    image_model: String,
    max_output_tokens: usize,
}

impl OpenAIClient {
    pub fn new(api_key: impl Into<String>, chat_model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: "https://api.openai.com".into(),
            api_key: api_key.into(),
            chat_model: chat_model.into(),
            embedding_model: "text-embedding-3-small".into(),
            image_model: "dall-e-3".into(),
            max_output_tokens: 0,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    pub fn with_image_model(mut self, model: impl Into<String>) -> Self {
        self.image_model = model.into();
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: usize) -> Self {
        self.max_output_tokens = tokens;
        self
    }

    fn build_body(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        format: ResponseFormat,
        stream: bool,
    ) -> serde_json::Value {
        let api_messages: Vec<serde_json::Value> =
            messages.iter().map(|m| self.message_to_api(m)).collect();

        let mut body = json!({
            "model": self.chat_model,
            "messages": api_messages,
            "stream": stream,
        });

        if self.max_output_tokens > 0 {
            body["max_tokens"] = json!(self.max_output_tokens);
        }

        if format == ResponseFormat::Json {
            body["response_format"] = json!({"type": "json_object"});
        }

        if !tools.is_empty() {
            let api_tools: Vec<serde_json::Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema(),
                        }
                    })
                })
                .collect();
            body["tools"] = json!(api_tools);
        }

        body
    }

    fn message_to_api(&self, msg: &Message) -> serde_json::Value {
        match msg.role {
            Role::Assistant => {
                let mut result = json!({"role": "assistant"});
                let mut content_text = String::new();
                let mut tool_calls: Vec<serde_json::Value> = Vec::new();

                for block in &msg.content {
                    match block {
                        ContentBlock::Text { text } => content_text.push_str(text),
                        ContentBlock::ToolCall {
                            id,
                            name,
                            arguments,
                        } => {
                            tool_calls.push(json!({
                                "id": id,
                                "type": "function",
                                "function": {
                                    "name": name,
                                    "arguments": arguments.to_string(),
                                }
                            }));
                        }
                        ContentBlock::ToolResult { .. } => {}
                    }
                }

                if !content_text.is_empty() {
                    result["content"] = json!(content_text);
                }
                if !tool_calls.is_empty() {
                    result["tool_calls"] = json!(tool_calls);
                }
                result
            }
            Role::Tool => match msg.content.first() {
                Some(ContentBlock::ToolResult {
                    tool_call_id,
                    content,
                }) => json!({
                    "role": "tool",
                    "tool_call_id": tool_call_id,
                    "content": content,
                }),
                _ => json!({"role": "user", "content": msg.text_content()}),
            },
            Role::User => json!({"role": "user", "content": msg.text_content()}),
            Role::System => json!({"role": "system", "content": msg.text_content()}),
        }
    }

    async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> CouncilResult<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let request = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(body)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(CouncilError::Interrupted),
            response = request => response?,
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CouncilError::Provider(format!(
                "OpenAI API error {status}: {body}"
            )));
        }
        Ok(response)
    }

    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> CouncilResult<serde_json::Value> {
        let response = self.post(path, body, cancel).await?;
        tokio::select! {
            _ = cancel.cancelled() => Err(CouncilError::Interrupted),
            value = response.json::<serde_json::Value>() => Ok(value?),
        }
    }
}

/// Parse a non-streamed `chat/completions` body
fn parse_completion(data: &serde_json::Value) -> CouncilResult<ChatCompletion> {
    let choice = data
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| CouncilError::Provider("response has no choices".into()))?;

    let message = choice.get("message").cloned().unwrap_or(json!({}));
    let text = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or_default();

    let mut calls = Vec::new();
    if let Some(tcs) = message.get("tool_calls").and_then(|v| v.as_array()) {
        for tc in tcs {
            let id = tc.get("id").and_then(|v| v.as_str()).unwrap_or_default();
            let func = tc.get("function").cloned().unwrap_or(json!({}));
            let name = func.get("name").and_then(|v| v.as_str()).unwrap_or_default();
            let args_str = func
                .get("arguments")
                .and_then(|v| v.as_str())
                .unwrap_or("{}");
            let args = serde_json::from_str(args_str).unwrap_or(json!({}));
            if !name.is_empty() {
                calls.push(ToolCall::new(id, name, args));
            }
        }
    }

    let finish_reason = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .map(FinishReason::from_api)
        .ok_or_else(|| CouncilError::Provider("response has no finish_reason".into()))?;

    Ok(ChatCompletion {
        message: Message::assistant_tool_calls(text, &calls),
        finish_reason,
    })
}

/// Translate one SSE `data:` payload into stream events
fn parse_stream_chunk(data: &serde_json::Value) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    let Some(choice) = data
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|c| c.first())
    else {
        return events;
    };

    if let Some(delta) = choice.get("delta") {
        if let Some(content) = delta.get("content").and_then(|v| v.as_str()) {
            if !content.is_empty() {
                events.push(StreamEvent::TextDelta {
                    text: content.to_string(),
                });
            }
        }

        if let Some(tcs) = delta.get("tool_calls").and_then(|v| v.as_array()) {
            for tc in tcs {
                let func = tc.get("function");
                events.push(StreamEvent::ToolCallDelta {
                    id: tc.get("id").and_then(|v| v.as_str()).map(String::from),
                    name: func
                        .and_then(|f| f.get("name"))
                        .and_then(|v| v.as_str())
                        .map(String::from),
                    arguments: func
                        .and_then(|f| f.get("arguments"))
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                });
            }
        }
    }

    if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
        events.push(StreamEvent::Finish {
            reason: FinishReason::from_api(reason),
        });
    }

    events
}

struct SseState {
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    /// Raw bytes; a multibyte character may straddle two network chunks
    buffer: Vec<u8>,
    pending: VecDeque<StreamEvent>,
    done: bool,
}

impl SseState {
    fn new(bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>) -> Self {
        Self {
            bytes,
            buffer: Vec::new(),
            pending: VecDeque::new(),
            done: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        self.drain_lines(false);
    }

    /// Move every complete line out of the buffer into pending events
    fn drain_lines(&mut self, flush: bool) {
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.handle_bytes(&line);
        }
        if flush && !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            self.handle_bytes(&rest);
        }
    }

    fn handle_bytes(&mut self, line: &[u8]) {
        match std::str::from_utf8(line) {
            Ok(line) => self.handle_line(line.trim_end()),
            Err(e) => tracing::warn!(error = %e, "dropping SSE line that is not valid UTF-8"),
        }
    }

    fn handle_line(&mut self, line: &str) {
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let data = data.trim();
        if data == "[DONE]" {
            self.done = true;
            return;
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(data) {
            self.pending.extend(parse_stream_chunk(&value));
        }
    }
}

#[async_trait]
impl LlmClient for OpenAIClient {
    fn name(&self) -> &str {
        "openai"
    }

    async fn chat_complete(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        format: ResponseFormat,
        cancel: &CancellationToken,
    ) -> CouncilResult<ChatCompletion> {
        let body = self.build_body(messages, tools, format, false);
        let data = self.post_json("/v1/chat/completions", &body, cancel).await?;
        parse_completion(&data)
    }

    async fn chat_complete_streaming(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        format: ResponseFormat,
        cancel: &CancellationToken,
    ) -> CouncilResult<EventStream> {
        let body = self.build_body(messages, tools, format, true);
        let response = self.post("/v1/chat/completions", &body, cancel).await?;

        let state = SseState::new(
            response
                .bytes_stream()
                .map(|chunk| chunk.map(|b| b.to_vec()))
                .boxed(),
        );

        let events = futures::stream::unfold(state, |mut st| async move {
            loop {
                if let Some(event) = st.pending.pop_front() {
                    return Some((Ok(event), st));
                }
                if st.done {
                    return None;
                }
                match st.bytes.next().await {
                    Some(Ok(chunk)) => st.push(&chunk),
                    Some(Err(e)) => {
                        st.done = true;
                        return Some((Err(CouncilError::Http(e)), st));
                    }
                    None => {
                        st.drain_lines(true);
                        st.done = true;
                    }
                }
            }
        });

        Ok(Box::pin(events))
    }

    async fn generate_embedding(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> CouncilResult<Vec<f32>> {
        let body = json!({"model": self.embedding_model, "input": text});
        let data = self.post_json("/v1/embeddings", &body, cancel).await?;
        let vector = data
            .get("data")
            .and_then(|v| v.as_array())
            .and_then(|d| d.first())
            .and_then(|d| d.get("embedding"))
            .and_then(|e| e.as_array())
            .ok_or_else(|| CouncilError::Provider("embedding response has no vector".into()))?;
        Ok(vector
            .iter()
            .filter_map(|v| v.as_f64())
            .map(|v| v as f32)
            .collect())
    }

    async fn generate_image(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> CouncilResult<ImageRef> {
        let body = json!({"model": self.image_model, "prompt": prompt, "n": 1});
        let data = self
            .post_json("/v1/images/generations", &body, cancel)
            .await?;
        let first = data
            .get("data")
            .and_then(|v| v.as_array())
            .and_then(|d| d.first())
            .ok_or_else(|| CouncilError::Provider("image response has no data".into()))?;

        if let Some(url) = first.get("url").and_then(|v| v.as_str()) {
            return Ok(ImageRef::Url {
                url: url.to_string(),
            });
        }
        first
            .get("b64_json")
            .and_then(|v| v.as_str())
            .map(|data| ImageRef::Base64 {
                data: data.to_string(),
            })
            .ok_or_else(|| CouncilError::Provider("image response has no url or payload".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> OpenAIClient {
        OpenAIClient::new("sk-test", "gpt-4o")
    }

    #[test]
    fn custom_base_url() {
        let client = client().with_base_url("http://localhost:8081");
        assert_eq!(client.base_url, "http://localhost:8081");
    }

    #[test]
    fn message_to_api_tool_result() {
        let msg = Message::tool_result("tc1", "file contents here");
        let api = client().message_to_api(&msg);
        assert_eq!(api["role"], "tool");
        assert_eq!(api["tool_call_id"], "tc1");
        assert_eq!(api["content"], "file contents here");
    }

    #[test]
    fn message_to_api_assistant_with_tool_calls() {
        let msg = Message::assistant_tool_calls(
            "I'll check",
            &[ToolCall::new("tc1", "read_docs", json!({"key": "a.md"}))],
        );
        let api = client().message_to_api(&msg);
        assert_eq!(api["content"], "I'll check");
        assert_eq!(api["tool_calls"][0]["function"]["name"], "read_docs");
    }

    #[test]
    fn builds_body_with_tools_and_json_format() {
        let tools = vec![ToolDefinition::new("list_docs", "List documents")];
        let body = client().build_body(&[Message::user("hi")], &tools, ResponseFormat::Json, true);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
        assert_eq!(body["tools"][0]["function"]["name"], "list_docs");
        assert_eq!(body["tools"][0]["function"]["parameters"]["type"], "object");
        assert_eq!(body["response_format"]["type"], "json_object");
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn parses_tool_call_completion() {
        let data = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "read_docs", "arguments": "{\"key\":\"a\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let completion = parse_completion(&data).unwrap();
        assert_eq!(completion.finish_reason, FinishReason::ToolCalls);
        let calls = completion.message.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments["key"], "a");
    }

    fn sse_state() -> SseState {
        SseState::new(futures::stream::empty().boxed())
    }

    #[test]
    fn sse_keeps_multibyte_text_split_across_chunks() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"café\"},\"finish_reason\":null}]}\n";
        let bytes = line.as_bytes();
        // split between the two bytes of 'é'
        let cut = line.find('é').unwrap() + 1;

        let mut state = sse_state();
        state.push(&bytes[..cut]);
        assert!(state.pending.is_empty());
        state.push(&bytes[cut..]);

        assert_eq!(
            state.pending.into_iter().collect::<Vec<_>>(),
            vec![StreamEvent::TextDelta { text: "café".into() }]
        );
    }

    #[test]
    fn sse_flushes_trailing_line_and_done_marker() {
        let mut state = sse_state();
        state.push(b"data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\ndata: [DONE]");
        assert_eq!(state.pending.len(), 1);
        assert!(!state.done);

        state.drain_lines(true);
        assert!(state.done);
    }

    #[test]
    fn completion_without_choices_is_an_error() {
        assert!(parse_completion(&json!({"choices": []})).is_err());
    }

    #[test]
    fn parses_stream_chunks() {
        let text = json!({"choices": [{"delta": {"content": "Hel"}, "finish_reason": null}]});
        assert_eq!(
            parse_stream_chunk(&text),
            vec![StreamEvent::TextDelta { text: "Hel".into() }]
        );

        let first = json!({"choices": [{"delta": {"tool_calls": [
            {"index": 0, "id": "call_1", "function": {"name": "read_docs", "arguments": ""}}
        ]}}]});
        assert_eq!(
            parse_stream_chunk(&first),
            vec![StreamEvent::ToolCallDelta {
                id: Some("call_1".into()),
                name: Some("read_docs".into()),
                arguments: String::new(),
            }]
        );

        let cont = json!({"choices": [{"delta": {"tool_calls": [
            {"index": 0, "function": {"arguments": "{\"key\""}}
        ]}}]});
        assert_eq!(
            parse_stream_chunk(&cont),
            vec![StreamEvent::ToolCallDelta {
                id: None,
                name: None,
                arguments: "{\"key\"".into(),
            }]
        );

        let end = json!({"choices": [{"delta": {}, "finish_reason": "length"}]});
        assert_eq!(
            parse_stream_chunk(&end),
            vec![StreamEvent::Finish {
                reason: FinishReason::Length
            }]
        );
    }
}
