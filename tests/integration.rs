use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use council_core::chat::StreamSink;
use council_core::error::CouncilResult;
use council_core::orchestrator::*;
use council_core::provider::LlmClient;
use council_core::store::*;
use council_core::tool::{MemoryObserver, ToolPhase};
use council_core::types::*;

// ─── Mock client ────────────────────────────────────────────────────────────

/// Agents are recognised by a `agent:<NAME>` persona. Each agent can have
/// scripted completions; once they run out it answers `<NAME>(<first line
/// of the request>)`. Every request is logged with the write flag state.
struct CouncilClient {
    scripts: Mutex<HashMap<String, VecDeque<ChatCompletion>>>,
    log: Mutex<Vec<(String, bool)>>,
    write_mode: OnceLock<WriteMode>,
    active_coders: AtomicUsize,
    max_active_coders: AtomicUsize,
    delay: Duration,
}

impl CouncilClient {
    fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            write_mode: OnceLock::new(),
            active_coders: AtomicUsize::new(0),
            max_active_coders: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn script(self, agent: &str, completions: Vec<ChatCompletion>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(agent.to_string(), completions.into());
        self
    }

    fn watch(&self, orchestrator: &Orchestrator) {
        let _ = self.write_mode.set(orchestrator.write_mode().clone());
    }

    fn log(&self) -> Vec<(String, bool)> {
        self.log.lock().unwrap().clone()
    }
}

fn persona_of(messages: &[Message]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::System && m.text_content().starts_with("agent:"))
        .map(|m| m.text_content().trim_start_matches("agent:").to_string())
        .unwrap_or_default()
}

fn tool_call(id: &str, name: &str, args: serde_json::Value) -> ChatCompletion {
    ChatCompletion {
        message: Message::assistant_tool_calls("", &[ToolCall::new(id, name, args)]),
        finish_reason: FinishReason::ToolCalls,
    }
}

#[async_trait]
impl LlmClient for CouncilClient {
    fn name(&self) -> &str {
        "council-mock"
    }

    async fn chat_complete(
        &self,
        messages: &[Message],
        _tools: &[ToolDefinition],
        _format: ResponseFormat,
        _cancel: &CancellationToken,
    ) -> CouncilResult<ChatCompletion> {
        let persona = persona_of(messages);
        let held = self.write_mode.get().map(|w| w.is_held()).unwrap_or(false);
        self.log.lock().unwrap().push((persona.clone(), held));

        let coder = persona.starts_with("CODER");
        if coder {
            let now = self.active_coders.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active_coders.fetch_max(now, Ordering::SeqCst);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if coder {
            self.active_coders.fetch_sub(1, Ordering::SeqCst);
        }

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&persona)
            .and_then(|queue| queue.pop_front());
        if let Some(completion) = scripted {
            return Ok(completion);
        }

        let request = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text_content())
            .unwrap_or_default();
        let first_line = request.lines().next().unwrap_or_default();
        Ok(ChatCompletion {
            message: Message::assistant(format!("{persona}({first_line})")),
            finish_reason: FinishReason::Stop,
        })
    }

    async fn generate_embedding(
        &self,
        text: &str,
        _cancel: &CancellationToken,
    ) -> CouncilResult<Vec<f32>> {
        Ok(letters(text))
    }
}

// ─── Mock embedder ──────────────────────────────────────────────────────────

/// Letter-frequency vector
fn letters(text: &str) -> Vec<f32> {
    let mut v = vec![0.0; 26];
    for c in text.chars().filter(|c| c.is_ascii_alphabetic()) {
        v[(c.to_ascii_lowercase() as u8 - b'a') as usize] += 1.0;
    }
    v
}

#[derive(Default)]
struct CountingEmbedder {
    calls: AtomicUsize,
}

impl CountingEmbedder {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for CountingEmbedder {
    async fn embed(&self, text: &str, _cancel: &CancellationToken) -> CouncilResult<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(letters(text))
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────────────

/// Log to the test writer; `RUST_LOG=council_core=debug` shows the call graph
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn council() -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_store(StoreDefinition::new("docs", "memory:"))
        .with_agent(
            AgentDefinition::new("planner", "agent:PLANNER")
                .with_store(StoreRef::writable("docs"))
                .with_peer("coder")
                .with_flow("ship"),
        )
        .with_agent(
            AgentDefinition::new("coder", "agent:CODER")
                .with_store(StoreRef::writable("docs"))
                .coder(),
        )
        .with_agent(
            AgentDefinition::new("reviewer", "agent:REVIEWER").with_store(StoreRef::read_only("docs")),
        )
        .with_flow(FlowDefinition::new("ship", ["planner", "coder", "reviewer"]))
}

async fn orchestrator(client: Arc<CouncilClient>) -> Arc<Orchestrator> {
    init_tracing();
    let orchestrator = Orchestrator::builder(council(), client.clone())
        .build()
        .await
        .unwrap();
    client.watch(&orchestrator);
    orchestrator
}

// ─── Orchestration ──────────────────────────────────────────────────────────

#[tokio::test]
async fn flow_pipelines_and_locks_only_the_coder_step() {
    let client = Arc::new(CouncilClient::new());
    let orchestrator = orchestrator(client.clone()).await;

    let out = orchestrator
        .call_flow("ship", "add retries", None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(out, "REVIEWER(CODER(PLANNER(add retries)))");
    assert_eq!(
        client.log(),
        vec![
            ("PLANNER".to_string(), false),
            ("CODER".to_string(), true),
            ("REVIEWER".to_string(), false),
        ]
    );
    assert!(!orchestrator.write_mode().is_held());
}

#[tokio::test]
async fn concurrent_coder_calls_are_serialized() {
    let client = Arc::new(CouncilClient::new().with_delay(Duration::from_millis(30)));
    let orchestrator = orchestrator(client.clone()).await;
    let cancel = CancellationToken::new();

    let (first, second) = tokio::join!(
        orchestrator.call_coder_agent("coder", "one", None, &cancel),
        orchestrator.call_coder_agent("coder", "two", None, &cancel),
    );
    assert_eq!(first.unwrap(), "CODER(one)");
    assert_eq!(second.unwrap(), "CODER(two)");

    assert_eq!(client.max_active_coders.load(Ordering::SeqCst), 1);
    assert!(client.log().iter().all(|(_, held)| *held));
    assert!(!orchestrator.write_mode().is_held());
}

#[tokio::test]
async fn write_tool_round_trip_through_an_agent() {
    init_tracing();
    let client = Arc::new(CouncilClient::new().script(
        "PLANNER",
        vec![tool_call(
            "w1",
            "write_docs",
            json!({"key": "plan.md", "content": "step one\nstep two"}),
        )],
    ));
    let observer = Arc::new(MemoryObserver::new());
    let orchestrator = Orchestrator::builder(council(), client.clone())
        .observer(observer.clone())
        .build()
        .await
        .unwrap();

    let out = orchestrator
        .call_agent("planner", "write the plan", None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(out, "PLANNER(write the plan)");

    let store = orchestrator.store("docs").unwrap();
    assert_eq!(
        store.get("plan.md").await.unwrap().as_deref(),
        Some("step one\nstep two")
    );

    let events = observer.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].phase, ToolPhase::Start);
    assert_eq!(events[1].phase, ToolPhase::End);
    assert!(events[1].payload.starts_with("Stored 'plan.md'"));
    assert!(!orchestrator.write_mode().is_held());
}

#[tokio::test]
async fn write_tool_rejected_while_another_caller_holds_the_lock() {
    init_tracing();
    let client = Arc::new(CouncilClient::new().script(
        "PLANNER",
        vec![tool_call("w1", "write_docs", json!({"key": "x.md", "content": "x"}))],
    ));
    let observer = Arc::new(MemoryObserver::new());
    let orchestrator = Orchestrator::builder(council(), client)
        .observer(observer.clone())
        .build()
        .await
        .unwrap();

    let outside = orchestrator.write_mode().try_acquire().unwrap();
    orchestrator
        .call_agent("planner", "write", None, &CancellationToken::new())
        .await
        .unwrap();
    drop(outside);

    let end = observer
        .events()
        .into_iter()
        .find(|e| e.phase == ToolPhase::End)
        .unwrap();
    assert!(end.payload.starts_with("Write rejected"));
    assert!(orchestrator.store("docs").unwrap().get("x.md").await.unwrap().is_none());
}

#[tokio::test]
async fn coder_peer_writes_under_the_inherited_lease() {
    let client = Arc::new(
        CouncilClient::new()
            .script(
                "PLANNER",
                vec![tool_call("a1", "ask_coder", json!({"query": "implement it"}))],
            )
            .script(
                "CODER",
                vec![tool_call(
                    "w1",
                    "write_docs",
                    json!({"key": "src/lib.rs", "content": "pub fn it() {}"}),
                )],
            ),
    );
    let orchestrator = orchestrator(client.clone()).await;

    orchestrator
        .call_agent("planner", "plan and build", None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        orchestrator
            .store("docs")
            .unwrap()
            .get("src/lib.rs")
            .await
            .unwrap()
            .as_deref(),
        Some("pub fn it() {}")
    );
    let coder_rounds: Vec<bool> = client
        .log()
        .into_iter()
        .filter(|(persona, _)| persona == "CODER")
        .map(|(_, held)| held)
        .collect();
    assert_eq!(coder_rounds, vec![true, true]);
    assert!(!orchestrator.write_mode().is_held());
}

#[tokio::test]
async fn streaming_agent_feeds_the_sink() {
    #[derive(Default)]
    struct Collect(Mutex<String>);

    impl StreamSink for Collect {
        fn on_text(&self, delta: &str) {
            self.0.lock().unwrap().push_str(delta);
        }
    }

    let orchestrator = orchestrator(Arc::new(CouncilClient::new())).await;
    let sink = Collect::default();
    let out = orchestrator
        .stream_agent("reviewer", "look", Some("user"), &sink, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(out, "REVIEWER(look)");
    assert_eq!(*sink.0.lock().unwrap(), out);
}

#[tokio::test]
async fn cancelled_call_is_interrupted() {
    let orchestrator = orchestrator(Arc::new(CouncilClient::new())).await;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = orchestrator
        .call_agent("reviewer", "anything", None, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, council_core::CouncilError::Interrupted));
}

// ─── Document store ─────────────────────────────────────────────────────────

#[tokio::test]
async fn restoring_unchanged_content_skips_embedding() {
    init_tracing();
    let embedder = Arc::new(CountingEmbedder::default());
    let store = DocumentStore::new("docs", StorageBackend::memory(), embedder.clone());
    let cancel = CancellationToken::new();

    store.store("k", "abc", None, true, &cancel).await.unwrap();
    let after_first = embedder.calls();
    assert_eq!(store.get("k").await.unwrap().as_deref(), Some("abc"));

    store.store("k", "abc", None, true, &cancel).await.unwrap();
    assert_eq!(embedder.calls(), after_first);
    assert_eq!(store.get("k").await.unwrap().as_deref(), Some("abc"));
    assert_eq!(store.list("", true).await.unwrap(), vec!["k"]);
}

#[tokio::test]
async fn split_document_registers_metadata_plus_every_part() {
    init_tracing();
    let store = DocumentStore::new(
        "docs",
        StorageBackend::memory(),
        Arc::new(CountingEmbedder::default()),
    )
    .with_chunking(ChunkPolicy { max_chars: 40 });
    let cancel = CancellationToken::new();

    let content = (1..=6)
        .map(|i| format!("Paragraph {i} talks about topic {i}."))
        .collect::<Vec<_>>()
        .join("\n\n");
    store.store("guide.md", &content, None, true, &cancel).await.unwrap();

    let parts = store.get_parts("guide.md").await.unwrap().unwrap();
    assert_eq!(parts[0], metadata_key("guide.md"));
    let chunks = &parts[1..];
    assert!(chunks.len() >= 2);

    let mut rebuilt = String::new();
    for (i, key) in chunks.iter().enumerate() {
        assert_eq!(key, &part_key("guide.md", i + 1));
        rebuilt.push_str(&store.get_chunk(key).await.unwrap().unwrap());
    }
    assert_eq!(rebuilt, content);

    for key in &parts {
        assert_eq!(
            store.get_parent_document(key).await.unwrap().as_deref(),
            Some("guide.md")
        );
    }
}

#[tokio::test]
async fn retrieval_is_ranked_and_within_budget() {
    init_tracing();
    let store = DocumentStore::new(
        "docs",
        StorageBackend::memory(),
        Arc::new(CountingEmbedder::default()),
    )
    .with_retrieval(RetrievalConfig {
        token_budget: 30,
        ..RetrievalConfig::default()
    });
    let cancel = CancellationToken::new();

    for (key, text) in [
        ("zz.md", "zzzz zzzz zzzz"),
        ("ab.md", "abab abab abab abab"),
        ("mixed.md", "ab zz ab zz"),
        ("long.md", &"lorem ipsum dolor sit amet ".repeat(20)),
    ] {
        store.store(key, text, None, false, &cancel).await.unwrap();
    }

    let hits = store.relevant_items("abab", &cancel).await.unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0].key, "ab.md");
    assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    let tokens: usize = hits.iter().map(|h| h.tokens()).sum();
    assert!(tokens <= 30);
    assert!(hits.iter().all(|h| h.key != "long.md"));
}

#[tokio::test]
async fn file_backend_survives_reopen_and_move() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let connection = dir.path().join("store").display().to_string();
    let cancel = CancellationToken::new();

    {
        let store = DocumentStore::open("docs", &connection, Arc::new(CountingEmbedder::default()))
            .await
            .unwrap();
        store.store("notes/a.md", "alpha", None, true, &cancel).await.unwrap();
        store
            .move_document("notes/a.md", "archive/a.md", true, &cancel)
            .await
            .unwrap();
    }

    let embedder = Arc::new(CountingEmbedder::default());
    let store = DocumentStore::open("docs", &connection, embedder.clone())
        .await
        .unwrap();
    assert!(store.get("notes/a.md").await.unwrap().is_none());
    assert_eq!(store.get("archive/a.md").await.unwrap().as_deref(), Some("alpha"));
    assert_eq!(store.list("archive", false).await.unwrap(), vec!["archive/a.md"]);
    assert_eq!(
        store.get_metadata("archive/a.md").await.unwrap().unwrap().path,
        "archive/a.md"
    );

    store.store("archive/a.md", "alpha", None, true, &cancel).await.unwrap();
    assert_eq!(embedder.calls(), 0);
}
