//! Agent orchestrator.
//!
//! Builds agents (stores + tool registry + persona) and flows (ordered agent
//! pipelines) from an [`OrchestratorConfig`], and runs agent, coder and flow
//! calls. Agent-to-agent and agent-to-flow calls are ordinary tools that
//! re-enter the orchestrator, carrying a [`CallScope`] with the call depth
//! and, inside write-protected calls, the [`WriteLease`].
//!
//! At most one write lease exists per orchestrator. Coder calls hold it for
//! their whole turn; flows hold it only around their coder steps; nested
//! calls inherit it instead of acquiring it again.

mod config;
mod families;
mod tools;
mod write_lock;

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio_util::sync::CancellationToken;

use crate::chat::{ChatLoop, StreamSink};
use crate::context::{ContextAssembler, ContextRequest};
use crate::error::{CouncilError, CouncilResult};
use crate::history::{History, HistoryEntry, HistoryLog};
use crate::provider::LlmClient;
use crate::store::{ClientEmbedder, DocumentStore, Embedder};
use crate::tool::{ToolContext, ToolObserver, ToolRegistry};
use crate::types::{Message, Role};

pub use config::{
    AgentDefinition, Capabilities, Capability, FlowDefinition, OrchestratorConfig,
    StoreDefinition, StoreRef,
};
pub use families::{CommandFamily, DelegationFamily, ToolFamily};
pub use tools::{tool_name, BuiltinKind, BuiltinTool};
pub use write_lock::{CallScope, WriteLease, WriteMode};

/// Appended to every coder request
pub const CODER_DIRECTIVE: &str = "When you create or modify a document, write its complete content \
with the write tool. Never abbreviate, elide or leave placeholders for unchanged parts.";

fn coder_request(query: &str) -> String {
    format!("{query}\n\n{CODER_DIRECTIVE}")
}

/// A built agent, immutable once the orchestrator exists
pub struct Agent {
    definition: AgentDefinition,
    /// Primary store first
    stores: Vec<Arc<DocumentStore>>,
    chat: ChatLoop,
}

impl Agent {
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &AgentDefinition {
        &self.definition
    }

    pub fn is_coder(&self) -> bool {
        self.definition.coder
    }

    pub fn stores(&self) -> &[Arc<DocumentStore>] {
        &self.stores
    }

    pub fn tools(&self) -> &ToolRegistry {
        self.chat.tools()
    }

    fn persona(&self) -> Vec<String> {
        if self.definition.persona.is_empty() {
            Vec::new()
        } else {
            vec![self.definition.persona.clone()]
        }
    }
}

/// How one turn was requested, for history correlation
#[derive(Clone, Copy)]
struct Invocation<'a> {
    caller: Option<&'a str>,
    flow: Option<&'a str>,
    function: &'static str,
}

pub struct Orchestrator {
    agents: HashMap<String, Agent>,
    flows: HashMap<String, FlowDefinition>,
    stores: HashMap<String, Arc<DocumentStore>>,
    history: History,
    write_mode: WriteMode,
    assembler: ContextAssembler,
    max_call_depth: usize,
}

impl Orchestrator {
    pub fn builder(config: OrchestratorConfig, client: Arc<dyn LlmClient>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config, client)
    }

    pub fn agent(&self, name: &str) -> CouncilResult<&Agent> {
        self.agents
            .get(name)
            .ok_or_else(|| CouncilError::UnknownAgent(name.to_string()))
    }

    pub fn flow(&self, name: &str) -> CouncilResult<&FlowDefinition> {
        self.flows
            .get(name)
            .ok_or_else(|| CouncilError::UnknownFlow(name.to_string()))
    }

    pub fn store(&self, name: &str) -> Option<&Arc<DocumentStore>> {
        self.stores.get(name)
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn write_mode(&self) -> &WriteMode {
        &self.write_mode
    }

    /// Plain agent call
    pub async fn call_agent(
        &self,
        name: &str,
        query: &str,
        caller: Option<&str>,
        cancel: &CancellationToken,
    ) -> CouncilResult<String> {
        self.agent_call(name, query, caller, &CallScope::root(), cancel)
            .await
    }

    /// Agent call under the write lock, with the full-content directive.
    /// Waits while another independent caller holds the lock.
    pub async fn call_coder_agent(
        &self,
        name: &str,
        query: &str,
        caller: Option<&str>,
        cancel: &CancellationToken,
    ) -> CouncilResult<String> {
        self.coder_call(name, query, caller, &CallScope::root(), cancel)
            .await
    }

    /// Run a flow as a pipeline and return the last step's output
    pub async fn call_flow(
        &self,
        name: &str,
        query: &str,
        caller: Option<&str>,
        cancel: &CancellationToken,
    ) -> CouncilResult<String> {
        self.flow_call(name, query, caller, &CallScope::root(), cancel)
            .await
    }

    /// Agent call whose top-level text is streamed to `sink`. Nested calls
    /// made through tools run without streaming. Coder agents take the
    /// write lock as in [`Orchestrator::call_coder_agent`].
    pub async fn stream_agent(
        &self,
        name: &str,
        query: &str,
        caller: Option<&str>,
        sink: &dyn StreamSink,
        cancel: &CancellationToken,
    ) -> CouncilResult<String> {
        let agent = self.agent(name)?;
        let scope = CallScope::root().child(self.max_call_depth)?;
        let invocation = Invocation {
            caller,
            flow: None,
            function: "stream_agent",
        };
        if agent.is_coder() {
            let scope = self.lease_scope(scope, cancel).await?;
            self.turn(name, &coder_request(query), invocation, &scope, cancel, Some(sink))
                .await
        } else {
            self.turn(name, query, invocation, &scope, cancel, Some(sink))
                .await
        }
    }

    pub(crate) async fn agent_call(
        &self,
        name: &str,
        query: &str,
        caller: Option<&str>,
        scope: &CallScope,
        cancel: &CancellationToken,
    ) -> CouncilResult<String> {
        let scope = scope.child(self.max_call_depth)?;
        let invocation = Invocation {
            caller,
            flow: None,
            function: "call_agent",
        };
        self.turn(name, query, invocation, &scope, cancel, None).await
    }

    pub(crate) async fn coder_call(
        &self,
        name: &str,
        query: &str,
        caller: Option<&str>,
        scope: &CallScope,
        cancel: &CancellationToken,
    ) -> CouncilResult<String> {
        self.agent(name)?;
        let scope = self
            .lease_scope(scope.child(self.max_call_depth)?, cancel)
            .await?;
        let invocation = Invocation {
            caller,
            flow: None,
            function: "call_coder_agent",
        };
        self.turn(name, &coder_request(query), invocation, &scope, cancel, None)
            .await
    }

    pub(crate) async fn flow_call(
        &self,
        name: &str,
        query: &str,
        caller: Option<&str>,
        scope: &CallScope,
        cancel: &CancellationToken,
    ) -> CouncilResult<String> {
        let flow = self.flow(name)?;
        let scope = scope.child(self.max_call_depth)?;

        let mut entry = HistoryEntry::new(Role::User, query)
            .with_function("call_flow")
            .with_flow(name);
        if let Some(caller) = caller {
            entry = entry.with_agent(caller);
        }
        let request_id = self.history.append(entry).await;
        tracing::info!(
            flow = name,
            caller = caller.unwrap_or("external"),
            correlation_id = %request_id,
            steps = flow.agents.len(),
            "flow call"
        );

        let mut input = query.to_string();
        for (index, step) in flow.agents.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(CouncilError::Interrupted);
            }
            tracing::debug!(flow = name, step = index + 1, agent = %step, "flow step");

            let invocation = Invocation {
                caller,
                flow: Some(name),
                function: "call_flow",
            };
            input = if self.agent(step)?.is_coder() {
                // a lease taken here is released when `step_scope` drops
                let step_scope = self.lease_scope(scope.clone(), cancel).await?;
                self.turn(step, &coder_request(&input), invocation, &step_scope, cancel, None)
                    .await?
            } else {
                self.turn(step, &input, invocation, &scope, cancel, None)
                    .await?
            };
        }

        self.history.resolve(&request_id, &input).await;
        Ok(input)
    }

    /// Reuse the enclosing lease, or wait for a fresh one
    async fn lease_scope(
        &self,
        scope: CallScope,
        cancel: &CancellationToken,
    ) -> CouncilResult<CallScope> {
        if scope.holds_lease() {
            return Ok(scope);
        }
        let lease = self.write_mode.acquire(cancel).await?;
        Ok(scope.with_lease(lease))
    }

    /// One agent turn: record the request, assemble context, run the chat
    /// loop, then record the reply against the same correlation id
    async fn turn(
        &self,
        name: &str,
        query: &str,
        invocation: Invocation<'_>,
        scope: &CallScope,
        cancel: &CancellationToken,
        sink: Option<&dyn StreamSink>,
    ) -> CouncilResult<String> {
        let agent = self.agent(name)?;
        let prior = self.history.snapshot().await;

        let mut entry = HistoryEntry::new(Role::User, query).with_function(invocation.function);
        if let Some(caller) = invocation.caller {
            entry = entry.with_agent(caller);
        }
        if let Some(flow) = invocation.flow {
            entry = entry.with_flow(flow);
        }
        let request_id = self.history.append(entry).await;

        tracing::info!(
            agent = name,
            caller = invocation.caller.unwrap_or("external"),
            function = invocation.function,
            correlation_id = %request_id,
            depth = scope.depth(),
            write_lock = scope.holds_lease(),
            "agent call"
        );

        let persona = agent.persona();
        let request = [Message::user(query)];
        let messages = self
            .assembler
            .assemble(
                &prior,
                ContextRequest {
                    stores: &agent.stores,
                    persona: &persona,
                    request: &request,
                    query,
                    include_file_listing: agent.definition.include_file_listing,
                },
                cancel,
            )
            .await?;

        let ctx = ToolContext::new(self.history.clone(), cancel.clone(), scope.clone());
        let result = match sink {
            Some(sink) => agent.chat.run_streaming(messages, &ctx, sink).await,
            None => agent.chat.run(messages, &ctx).await,
        };
        let turn = match result {
            Ok(turn) => turn,
            Err(e) => {
                tracing::warn!(agent = name, correlation_id = %request_id, error = %e, "agent call failed");
                return Err(e);
            }
        };

        self.history.resolve(&request_id, &turn.text).await;
        let mut reply = HistoryEntry::new(Role::Assistant, &turn.text)
            .with_agent(name)
            .with_function(invocation.function);
        if let Some(flow) = invocation.flow {
            reply = reply.with_flow(flow);
        }
        self.history.append(reply).await;

        tracing::debug!(agent = name, correlation_id = %request_id, rounds = turn.tool_rounds, "agent call finished");
        Ok(turn.text)
    }
}

// ─── Builder ────────────────────────────────────────────────────────────────

pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    client: Arc<dyn LlmClient>,
    embedder: Option<Arc<dyn Embedder>>,
    stores: HashMap<String, Arc<DocumentStore>>,
    families: Vec<(Capability, Arc<dyn ToolFamily>)>,
    observer: Option<Arc<dyn ToolObserver>>,
    history: Option<History>,
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig, client: Arc<dyn LlmClient>) -> Self {
        Self {
            config,
            client,
            embedder: None,
            stores: HashMap::new(),
            families: Vec::new(),
            observer: None,
            history: None,
        }
    }

    /// Embedder for stores opened from definitions; defaults to the client
    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// A ready-made store. Replaces a definition with the same name.
    pub fn store(mut self, store: Arc<DocumentStore>) -> Self {
        self.stores.insert(store.name().to_string(), store);
        self
    }

    pub fn tool_family(mut self, capability: Capability, family: Arc<dyn ToolFamily>) -> Self {
        self.families.push((capability, family));
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ToolObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Share an existing history instead of starting a fresh one
    pub fn history(mut self, history: History) -> Self {
        self.history = Some(history);
        self
    }

    /// Validate references, open stores, then build every agent. All
    /// configuration errors surface here, never at call time.
    pub async fn build(self) -> CouncilResult<Arc<Orchestrator>> {
        let OrchestratorBuilder {
            config,
            client,
            embedder,
            mut stores,
            families,
            observer,
            history,
        } = self;

        let supplied: Vec<&str> = stores.keys().map(String::as_str).collect();
        config.validate(&supplied)?;

        let embedder = embedder.unwrap_or_else(|| Arc::new(ClientEmbedder(client.clone())));
        for definition in &config.stores {
            if stores.contains_key(&definition.name) {
                continue;
            }
            let store = DocumentStore::open(&definition.name, &definition.connection, embedder.clone())
                .await?
                .with_chunking(config.chunking)
                .with_retrieval(config.retrieval);
            stores.insert(definition.name.clone(), Arc::new(store));
        }

        let history = match (history, &config.history_log) {
            (Some(history), _) => history,
            (None, Some(path)) => History::restore(HistoryLog::new(path)).await?,
            (None, None) => History::new(),
        };

        for agent in &config.agents {
            for capability in agent.capabilities.enabled() {
                if !families.iter().any(|(c, _)| *c == capability) {
                    tracing::warn!(agent = %agent.name, %capability, "no tool family registered for capability");
                }
            }
        }

        let definitions: HashMap<&str, &AgentDefinition> =
            config.agents.iter().map(|a| (a.name.as_str(), a)).collect();
        let write_mode = WriteMode::new();

        let orchestrator = Arc::new_cyclic(|weak: &Weak<Orchestrator>| {
            let wiring = Wiring {
                client: &client,
                stores: &stores,
                definitions: &definitions,
                flows: &config.flows,
                families: &families,
                observer: observer.as_ref(),
                write_mode: &write_mode,
                orchestrator: weak,
                config: &config,
            };
            let agents = config
                .agents
                .iter()
                .map(|definition| (definition.name.clone(), wiring.agent(definition)))
                .collect();

            Orchestrator {
                agents,
                flows: config
                    .flows
                    .iter()
                    .map(|f| (f.name.clone(), f.clone()))
                    .collect(),
                stores: stores.clone(),
                history,
                write_mode: write_mode.clone(),
                assembler: ContextAssembler::new(config.context, config.retrieval.token_budget),
                max_call_depth: config.max_call_depth,
            }
        });

        tracing::info!(
            agents = orchestrator.agents.len(),
            flows = orchestrator.flows.len(),
            stores = orchestrator.stores.len(),
            "orchestrator built"
        );
        Ok(orchestrator)
    }
}

/// Everything needed to resolve one agent's tools
struct Wiring<'a> {
    client: &'a Arc<dyn LlmClient>,
    stores: &'a HashMap<String, Arc<DocumentStore>>,
    definitions: &'a HashMap<&'a str, &'a AgentDefinition>,
    flows: &'a [FlowDefinition],
    families: &'a [(Capability, Arc<dyn ToolFamily>)],
    observer: Option<&'a Arc<dyn ToolObserver>>,
    write_mode: &'a WriteMode,
    orchestrator: &'a Weak<Orchestrator>,
    config: &'a OrchestratorConfig,
}

impl Wiring<'_> {
    fn agent(&self, definition: &AgentDefinition) -> Agent {
        let mut registry = ToolRegistry::new();
        if let Some(observer) = self.observer {
            registry.set_observer(observer.clone());
        }

        let mut stores = Vec::new();
        for reference in definition.store_order() {
            let Some(store) = self.stores.get(&reference.store) else {
                continue;
            };
            stores.push(store.clone());
            for tool in BuiltinTool::for_store(store, reference.writable, self.write_mode) {
                registry.add(Arc::new(tool));
            }
        }

        for peer in &definition.agents {
            let (description, coder) = self
                .definitions
                .get(peer.as_str())
                .map(|d| (d.description.as_str(), d.coder))
                .unwrap_or(("", false));
            registry.add(Arc::new(BuiltinTool::ask_agent(
                &definition.name,
                peer,
                description,
                coder,
                self.orchestrator.clone(),
            )));
        }

        for flow in &definition.flows {
            let steps = self
                .flows
                .iter()
                .find(|f| &f.name == flow)
                .map(|f| f.agents.as_slice())
                .unwrap_or_default();
            registry.add(Arc::new(BuiltinTool::run_flow(
                &definition.name,
                flow,
                steps,
                self.orchestrator.clone(),
            )));
        }

        for capability in definition.capabilities.enabled() {
            for (_, family) in self.families.iter().filter(|(c, _)| *c == capability) {
                for tool in family.tools(definition) {
                    registry.add(tool);
                }
            }
        }

        tracing::debug!(agent = %definition.name, tools = registry.len(), "agent built");
        Agent {
            definition: definition.clone(),
            stores,
            chat: ChatLoop::new(self.client.clone(), registry, self.config.chat.clone()),
        }
    }
}
