//! Chat interaction loop.
//!
//! One agent turn is a bounded request / tool / request cycle:
//!
//! ```text
//! Requesting ──stop──────────▶ Done
//!     │  ▲
//!  tool_calls
//!     ▼  │
//! ExecutingTools
//!
//! length / content_filter / unknown ──▶ Fatal
//! ```
//!
//! Intermediate tool-call rounds never reach the caller; only the text of
//! the final `stop` round is returned.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::error::{CouncilError, CouncilResult};
use crate::provider::LlmClient;
use crate::tool::{ToolContext, ToolRegistry};
use crate::types::*;

fn default_max_tool_rounds() -> usize {
    10
}

/// Chat loop tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Upper bound on tool-call rounds in a single turn
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    #[serde(default)]
    pub format: ResponseFormat,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            format: ResponseFormat::default(),
        }
    }
}

/// Receives streamed output as it arrives, inside the loop's own task
pub trait StreamSink: Send + Sync {
    fn on_text(&self, delta: &str);

    /// Called once per reconstructed tool call, before it executes
    fn on_tool_call(&self, _call: &ToolCall) {}
}

/// Result of one completed turn
#[derive(Debug, Clone)]
pub struct ChatTurn {
    /// Text of the final round
    pub text: String,
    /// Messages produced during the turn, in order
    pub messages: Vec<Message>,
    pub tool_rounds: usize,
}

/// A tool call whose argument text is still growing
#[derive(Debug, Clone)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

/// Rebuilds one streamed round from its events.
///
/// Tool-call fragments are keyed by id: a fragment carrying an unseen id opens
/// a new call, a fragment carrying a known id or no id at all extends a call.
/// Nothing is final until the round's finish event arrives.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    text: String,
    calls: Vec<PendingCall>,
    by_id: HashMap<String, usize>,
    finish: Option<FinishReason>,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one event; returns the text delta, if any, for the sink
    pub fn push(&mut self, event: StreamEvent) -> Option<String> {
        match event {
            StreamEvent::TextDelta { text } => {
                self.text.push_str(&text);
                Some(text)
            }
            StreamEvent::ToolCallDelta {
                id,
                name,
                arguments,
            } => {
                let index = self.call_index(id);
                let call = &mut self.calls[index];
                if let Some(name) = name {
                    if call.name.is_empty() {
                        call.name = name;
                    }
                }
                call.arguments.push_str(&arguments);
                None
            }
            StreamEvent::Finish { reason } => {
                self.finish = Some(reason);
                None
            }
        }
    }

    fn call_index(&mut self, id: Option<String>) -> usize {
        match id {
            Some(id) if !id.is_empty() => {
                if let Some(&index) = self.by_id.get(&id) {
                    return index;
                }
                self.open_call(id)
            }
            _ => match self.calls.len() {
                0 => self.open_call(format!("call_{}", uuid::Uuid::new_v4().simple())),
                n => n - 1,
            },
        }
    }

    fn open_call(&mut self, id: String) -> usize {
        let index = self.calls.len();
        self.by_id.insert(id.clone(), index);
        self.calls.push(PendingCall {
            id,
            name: String::new(),
            arguments: String::new(),
        });
        index
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn finish_reason(&self) -> Option<&FinishReason> {
        self.finish.as_ref()
    }

    /// Finalize the round into a completion. Fails if no finish event was seen.
    pub fn finish(self) -> CouncilResult<ChatCompletion> {
        let finish_reason = self.finish.ok_or_else(|| {
            CouncilError::Provider("stream ended without a finish reason".into())
        })?;

        let calls: Vec<ToolCall> = self
            .calls
            .into_iter()
            .map(|pending| {
                let arguments = parse_arguments(&pending.name, &pending.arguments);
                ToolCall::new(pending.id, pending.name, arguments)
            })
            .collect();

        Ok(ChatCompletion {
            message: Message::assistant_tool_calls(self.text, &calls),
            finish_reason,
        })
    }
}

fn parse_arguments(tool: &str, raw: &str) -> serde_json::Value {
    if raw.trim().is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|e| {
        tracing::warn!(tool, error = %e, "tool arguments are not valid JSON");
        serde_json::Value::String(raw.to_string())
    })
}

/// Drives one agent turn against an LLM client
pub struct ChatLoop {
    client: Arc<dyn LlmClient>,
    tools: ToolRegistry,
    config: ChatConfig,
}

impl ChatLoop {
    pub fn new(client: Arc<dyn LlmClient>, tools: ToolRegistry, config: ChatConfig) -> Self {
        Self {
            client,
            tools,
            config,
        }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Non-streaming turn
    pub async fn run(&self, messages: Vec<Message>, ctx: &ToolContext) -> CouncilResult<ChatTurn> {
        self.drive(messages, ctx, None).await
    }

    /// Streaming turn; text deltas go to `sink` as they arrive
    pub async fn run_streaming(
        &self,
        messages: Vec<Message>,
        ctx: &ToolContext,
        sink: &dyn StreamSink,
    ) -> CouncilResult<ChatTurn> {
        self.drive(messages, ctx, Some(sink)).await
    }

    async fn drive(
        &self,
        mut messages: Vec<Message>,
        ctx: &ToolContext,
        sink: Option<&dyn StreamSink>,
    ) -> CouncilResult<ChatTurn> {
        let definitions = self.tools.definitions();
        let mut produced: Vec<Message> = Vec::new();
        let mut rounds = 0;

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(CouncilError::Interrupted);
            }

            tracing::debug!(
                client = self.client.name(),
                round = rounds,
                messages = messages.len(),
                "requesting completion"
            );

            let completion = match sink {
                Some(sink) => self.request_streamed(&messages, &definitions, ctx, sink).await?,
                None => self.request(&messages, &definitions, ctx).await?,
            };

            match completion.finish_reason {
                FinishReason::Stop => {
                    let text = completion.message.text_content();
                    produced.push(completion.message);
                    return Ok(ChatTurn {
                        text,
                        messages: produced,
                        tool_rounds: rounds,
                    });
                }
                FinishReason::ToolCalls => {
                    let calls = completion.message.tool_calls();
                    if calls.is_empty() {
                        return Err(CouncilError::Provider(
                            "tool_calls finish without any tool call".into(),
                        ));
                    }

                    rounds += 1;
                    if rounds > self.config.max_tool_rounds {
                        tracing::warn!(max = self.config.max_tool_rounds, "tool round cap reached");
                        return Err(CouncilError::ToolRoundLimit {
                            rounds: self.config.max_tool_rounds,
                        });
                    }

                    messages.push(completion.message.clone());
                    produced.push(completion.message);

                    for call in &calls {
                        if let Some(sink) = sink {
                            sink.on_tool_call(call);
                        }
                        let result = self.tools.execute(ctx, call).await;
                        let result_msg = Message::tool_result(&call.id, result);
                        messages.push(result_msg.clone());
                        produced.push(result_msg);
                    }
                }
                other => {
                    return Err(CouncilError::UnsupportedFinishReason {
                        reason: other.to_string(),
                    });
                }
            }
        }
    }

    async fn request(
        &self,
        messages: &[Message],
        definitions: &[ToolDefinition],
        ctx: &ToolContext,
    ) -> CouncilResult<ChatCompletion> {
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(CouncilError::Interrupted),
            result = self.client.chat_complete(messages, definitions, self.config.format, &ctx.cancel) => result,
        }
    }

    async fn request_streamed(
        &self,
        messages: &[Message],
        definitions: &[ToolDefinition],
        ctx: &ToolContext,
        sink: &dyn StreamSink,
    ) -> CouncilResult<ChatCompletion> {
        let mut stream = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(CouncilError::Interrupted),
            result = self.client.chat_complete_streaming(messages, definitions, self.config.format, &ctx.cancel) => result?,
        };

        let mut assembler = StreamAssembler::new();
        loop {
            let next = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(CouncilError::Interrupted),
                next = stream.next() => next,
            };
            match next {
                Some(event) => {
                    if let Some(delta) = assembler.push(event?) {
                        sink.on_text(&delta);
                    }
                }
                None => break,
            }
        }
        assembler.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::History;
    use crate::orchestrator::CallScope;
    use crate::provider::EventStream;
    use crate::tool::Tool;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    // Mock client that returns canned completions and records each request
    struct ScriptedClient {
        completions: Mutex<VecDeque<ChatCompletion>>,
        streams: Mutex<VecDeque<Vec<StreamEvent>>>,
        requests: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedClient {
        fn new(completions: Vec<ChatCompletion>) -> Self {
            Self {
                completions: Mutex::new(completions.into()),
                streams: Mutex::new(VecDeque::new()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn streaming(rounds: Vec<Vec<StreamEvent>>) -> Self {
            Self {
                completions: Mutex::new(VecDeque::new()),
                streams: Mutex::new(rounds.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn chat_complete(
            &self,
            messages: &[Message],
            _tools: &[ToolDefinition],
            _format: ResponseFormat,
            _cancel: &CancellationToken,
        ) -> CouncilResult<ChatCompletion> {
            self.requests.lock().unwrap().push(messages.to_vec());
            self.completions
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| CouncilError::Provider("No more mock responses".into()))
        }

        async fn chat_complete_streaming(
            &self,
            messages: &[Message],
            _tools: &[ToolDefinition],
            _format: ResponseFormat,
            _cancel: &CancellationToken,
        ) -> CouncilResult<EventStream> {
            self.requests.lock().unwrap().push(messages.to_vec());
            let events = self
                .streams
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| CouncilError::Provider("No more mock streams".into()))?;
            Ok(Box::pin(futures::stream::iter(events.into_iter().map(Ok))))
        }

        async fn generate_embedding(
            &self,
            _text: &str,
            _cancel: &CancellationToken,
        ) -> CouncilResult<Vec<f32>> {
            Ok(vec![0.0])
        }
    }

    struct UppercaseTool {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Tool for UppercaseTool {
        fn name(&self) -> &str {
            "uppercase"
        }

        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("uppercase", "Convert text to uppercase").with_parameter(
                ToolParameter::required("text", ParameterType::String, "Input text"),
            )
        }

        async fn execute(&self, _ctx: &ToolContext, call: &ToolCall) -> String {
            self.calls.fetch_add(1, Ordering::SeqCst);
            call.str_arg("text").unwrap_or_default().to_uppercase()
        }
    }

    #[derive(Default)]
    struct CollectSink {
        text: Mutex<String>,
        calls: Mutex<Vec<String>>,
    }

    impl StreamSink for CollectSink {
        fn on_text(&self, delta: &str) {
            self.text.lock().unwrap().push_str(delta);
        }

        fn on_tool_call(&self, call: &ToolCall) {
            self.calls.lock().unwrap().push(call.name.clone());
        }
    }

    fn ctx() -> ToolContext {
        ToolContext::new(History::new(), CancellationToken::new(), CallScope::root())
    }

    fn tool_round(id: &str, text: &str) -> ChatCompletion {
        ChatCompletion {
            message: Message::assistant_tool_calls(
                "",
                &[ToolCall::new(id, "uppercase", json!({"text": text}))],
            ),
            finish_reason: FinishReason::ToolCalls,
        }
    }

    fn stop(text: &str) -> ChatCompletion {
        ChatCompletion {
            message: Message::assistant(text),
            finish_reason: FinishReason::Stop,
        }
    }

    fn setup(client: ScriptedClient, max_rounds: usize) -> (Arc<ScriptedClient>, Arc<UppercaseTool>, ChatLoop) {
        let client = Arc::new(client);
        let tool = Arc::new(UppercaseTool {
            calls: AtomicUsize::new(0),
        });
        let mut tools = ToolRegistry::new();
        tools.add(tool.clone());
        let chat = ChatLoop::new(
            client.clone(),
            tools,
            ChatConfig {
                max_tool_rounds: max_rounds,
                ..Default::default()
            },
        );
        (client, tool, chat)
    }

    #[tokio::test]
    async fn simple_response() {
        let (client, _, chat) = setup(ScriptedClient::new(vec![stop("Hello! How can I help?")]), 10);
        let turn = chat.run(vec![Message::user("hi")], &ctx()).await.unwrap();
        assert_eq!(turn.text, "Hello! How can I help?");
        assert_eq!(turn.tool_rounds, 0);
        assert_eq!(client.request_count(), 1);
    }

    #[tokio::test]
    async fn tool_round_trip() {
        let (client, tool, chat) = setup(
            ScriptedClient::new(vec![tool_round("tc1", "hello world"), stop("HELLO WORLD it is")]),
            10,
        );

        let turn = chat
            .run(vec![Message::user("uppercase hello world")], &ctx())
            .await
            .unwrap();

        assert_eq!(turn.text, "HELLO WORLD it is");
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
        assert_eq!(turn.tool_rounds, 1);

        // assistant tool call, one tool result, final answer
        assert_eq!(turn.messages.len(), 3);
        let results: Vec<&Message> = turn.messages.iter().filter(|m| m.role == Role::Tool).collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].text_content(), "HELLO WORLD");

        let second_request = &client.requests.lock().unwrap()[1];
        assert_eq!(second_request.len(), 3);
        assert_eq!(second_request[2].role, Role::Tool);
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_to_model() {
        let completion = ChatCompletion {
            message: Message::assistant_tool_calls("", &[ToolCall::new("tc1", "nonexistent", json!({}))]),
            finish_reason: FinishReason::ToolCalls,
        };
        let (_, _, chat) = setup(ScriptedClient::new(vec![completion, stop("ok")]), 10);

        let turn = chat.run(vec![Message::user("call it")], &ctx()).await.unwrap();
        assert!(turn.messages[1].text_content().contains("unknown tool"));
        assert_eq!(turn.text, "ok");
    }

    #[tokio::test]
    async fn round_cap_terminates_loop() {
        let rounds = (0..5).map(|i| tool_round(&format!("tc{i}"), "x")).collect();
        let (client, tool, chat) = setup(ScriptedClient::new(rounds), 2);

        let err = chat.run(vec![Message::user("loop forever")], &ctx()).await.unwrap_err();
        assert!(matches!(err, CouncilError::ToolRoundLimit { rounds: 2 }));
        assert_eq!(tool.calls.load(Ordering::SeqCst), 2);
        assert_eq!(client.request_count(), 3);
    }

    #[tokio::test]
    async fn length_is_fatal() {
        let truncated = ChatCompletion {
            message: Message::assistant("partial"),
            finish_reason: FinishReason::Length,
        };
        let (_, _, chat) = setup(ScriptedClient::new(vec![truncated]), 10);
        let err = chat.run(vec![Message::user("long")], &ctx()).await.unwrap_err();
        assert!(matches!(err, CouncilError::UnsupportedFinishReason { ref reason } if reason == "length"));
    }

    #[tokio::test]
    async fn content_filter_is_fatal() {
        let filtered = ChatCompletion {
            message: Message::assistant(""),
            finish_reason: FinishReason::ContentFilter,
        };
        let (_, _, chat) = setup(ScriptedClient::new(vec![filtered]), 10);
        let err = chat.run(vec![Message::user("x")], &ctx()).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn cancelled_turn_is_interrupted() {
        let (client, _, chat) = setup(ScriptedClient::new(vec![stop("never")]), 10);
        let ctx = ctx();
        ctx.cancel.cancel();
        let err = chat.run(vec![Message::user("hi")], &ctx).await.unwrap_err();
        assert!(matches!(err, CouncilError::Interrupted));
        assert_eq!(client.request_count(), 0);
    }

    #[tokio::test]
    async fn streaming_reassembles_fragmented_calls() {
        let first_round = vec![
            StreamEvent::TextDelta { text: "Let me ".into() },
            StreamEvent::TextDelta { text: "check.".into() },
            StreamEvent::ToolCallDelta {
                id: Some("a".into()),
                name: Some("uppercase".into()),
                arguments: "{\"text\":".into(),
            },
            StreamEvent::ToolCallDelta {
                id: None,
                name: None,
                arguments: "\"one\"}".into(),
            },
            StreamEvent::ToolCallDelta {
                id: Some("b".into()),
                name: Some("uppercase".into()),
                arguments: "{\"te".into(),
            },
            StreamEvent::ToolCallDelta {
                id: Some("b".into()),
                name: None,
                arguments: "xt\":\"two\"}".into(),
            },
            StreamEvent::Finish {
                reason: FinishReason::ToolCalls,
            },
        ];
        let second_round = vec![
            StreamEvent::TextDelta { text: "ONE and TWO".into() },
            StreamEvent::Finish {
                reason: FinishReason::Stop,
            },
        ];

        let (_, tool, chat) = setup(ScriptedClient::streaming(vec![first_round, second_round]), 10);
        let sink = CollectSink::default();
        let turn = chat
            .run_streaming(vec![Message::user("go")], &ctx(), &sink)
            .await
            .unwrap();

        assert_eq!(turn.text, "ONE and TWO");
        assert_eq!(tool.calls.load(Ordering::SeqCst), 2);
        assert_eq!(*sink.text.lock().unwrap(), "Let me check.ONE and TWO");
        assert_eq!(sink.calls.lock().unwrap().len(), 2);

        let results: Vec<String> = turn
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.text_content())
            .collect();
        assert_eq!(results, vec!["ONE", "TWO"]);
    }

    #[test]
    fn assembler_requires_finish() {
        let mut assembler = StreamAssembler::new();
        assembler.push(StreamEvent::TextDelta { text: "cut off".into() });
        assert!(assembler.finish().is_err());
    }

    #[test]
    fn assembler_invalid_arguments_kept_raw() {
        let mut assembler = StreamAssembler::new();
        assembler.push(StreamEvent::ToolCallDelta {
            id: Some("x".into()),
            name: Some("uppercase".into()),
            arguments: "{broken".into(),
        });
        assembler.push(StreamEvent::Finish {
            reason: FinishReason::ToolCalls,
        });
        let completion = assembler.finish().unwrap();
        let calls = completion.message.tool_calls();
        assert_eq!(calls[0].arguments, json!("{broken"));
    }
}
