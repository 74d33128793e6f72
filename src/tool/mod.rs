use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::history::History;
use crate::orchestrator::CallScope;
use crate::types::{ToolCall, ToolDefinition};

/// One requested tool round: name plus arguments, answered by a string
pub type ToolInvocation = ToolCall;

/// Everything a tool sees besides its own arguments
#[derive(Clone)]
pub struct ToolContext {
    pub history: History,
    pub cancel: CancellationToken,
    pub scope: CallScope,
}

impl ToolContext {
    pub fn new(history: History, cancel: CancellationToken, scope: CallScope) -> Self {
        Self {
            history,
            cancel,
            scope,
        }
    }
}

/// A tool that can be called by the model.
///
/// Execution never fails: problems are reported in the returned text, which
/// is forwarded verbatim to the model as the tool result.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (must match the definition name)
    fn name(&self) -> &str;

    fn definition(&self) -> ToolDefinition;

    async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> String;
}

/// Progress hook for tool calls. The correlation id is the tool call id.
pub trait ToolObserver: Send + Sync {
    fn on_tool_start(&self, correlation_id: &str, tool_name: &str, payload: &str);

    fn on_tool_end(&self, correlation_id: &str, tool_name: &str, payload: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolPhase {
    Start,
    End,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolEvent {
    pub phase: ToolPhase,
    pub correlation_id: String,
    pub tool_name: String,
    pub payload: String,
}

/// Observer that keeps every event in memory (for testing / inspection)
#[derive(Default)]
pub struct MemoryObserver {
    events: Mutex<Vec<ToolEvent>>,
}

impl MemoryObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ToolEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    fn record(&self, phase: ToolPhase, correlation_id: &str, tool_name: &str, payload: &str) {
        if let Ok(mut events) = self.events.lock() {
            events.push(ToolEvent {
                phase,
                correlation_id: correlation_id.to_string(),
                tool_name: tool_name.to_string(),
                payload: payload.to_string(),
            });
        }
    }
}

impl ToolObserver for MemoryObserver {
    fn on_tool_start(&self, correlation_id: &str, tool_name: &str, payload: &str) {
        self.record(ToolPhase::Start, correlation_id, tool_name, payload);
    }

    fn on_tool_end(&self, correlation_id: &str, tool_name: &str, payload: &str) {
        self.record(ToolPhase::End, correlation_id, tool_name, payload);
    }
}

/// Name-keyed tool collection, resolved once when an agent is built
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    by_name: HashMap<String, usize>,
    observer: Option<Arc<dyn ToolObserver>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(mut self, observer: Arc<dyn ToolObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn set_observer(&mut self, observer: Arc<dyn ToolObserver>) {
        self.observer = Some(observer);
    }

    /// Register a tool. The first registration of a name wins; later ones are dropped.
    pub fn add(&mut self, tool: Arc<dyn Tool>) -> bool {
        let name = tool.name().to_string();
        if self.by_name.contains_key(&name) {
            tracing::debug!(tool = %name, "duplicate tool registration ignored");
            return false;
        }
        self.by_name.insert(name, self.tools.len());
        self.tools.push(tool);
        true
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.by_name.get(name).map(|&i| &self.tools[i])
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Run one tool call, notifying the observer around it
    pub async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> String {
        if let Some(observer) = &self.observer {
            observer.on_tool_start(&call.id, &call.name, &call.arguments.to_string());
        }
        tracing::debug!(tool = %call.name, call_id = %call.id, "tool call started");

        let result = match self.get(&call.name) {
            Some(tool) => tool.execute(ctx, call).await,
            None => format!("Error: unknown tool '{}'", call.name),
        };

        tracing::debug!(tool = %call.name, call_id = %call.id, bytes = result.len(), "tool call finished");
        if let Some(observer) = &self.observer {
            observer.on_tool_end(&call.id, &call.name, &result);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ParameterType, ToolParameter};
    use serde_json::json;

    struct EchoTool {
        name: &'static str,
        prefix: &'static str,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }

        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new(self.name, "Echo back the input").with_parameter(
                ToolParameter::required("message", ParameterType::String, "Text to echo"),
            )
        }

        async fn execute(&self, _ctx: &ToolContext, call: &ToolCall) -> String {
            let message = call.str_arg("message").unwrap_or("no message");
            format!("{}{message}", self.prefix)
        }
    }

    fn ctx() -> ToolContext {
        ToolContext::new(History::new(), CancellationToken::new(), CallScope::root())
    }

    fn echo(prefix: &'static str) -> Arc<dyn Tool> {
        Arc::new(EchoTool {
            name: "echo",
            prefix,
        })
    }

    #[test]
    fn registry_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        assert!(registry.is_empty());

        assert!(registry.add(echo("")));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("echo").unwrap().name(), "echo");
        assert!(registry.get("nonexistent").is_none());
        assert_eq!(registry.names(), vec!["echo"]);
    }

    #[tokio::test]
    async fn first_registration_wins() {
        let mut registry = ToolRegistry::new();
        registry.add(echo("first:"));
        assert!(!registry.add(echo("second:")));
        assert_eq!(registry.len(), 1);

        let call = ToolCall::new("c1", "echo", json!({"message": "hi"}));
        assert_eq!(registry.execute(&ctx(), &call).await, "first:hi");
    }

    #[test]
    fn registry_definitions() {
        let mut registry = ToolRegistry::new();
        registry.add(echo(""));

        let defs = registry.definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].input_schema()["required"][0], "message");
    }

    #[tokio::test]
    async fn unknown_tool_is_a_result_string() {
        let registry = ToolRegistry::new();
        let call = ToolCall::new("c1", "missing", json!({}));
        let out = registry.execute(&ctx(), &call).await;
        assert!(out.starts_with("Error:"));
        assert!(out.contains("missing"));
    }

    #[tokio::test]
    async fn observer_sees_start_and_end() {
        let observer = Arc::new(MemoryObserver::new());
        let mut registry = ToolRegistry::new().with_observer(observer.clone());
        registry.add(echo(""));

        let call = ToolCall::new("corr-7", "echo", json!({"message": "ping"}));
        registry.execute(&ctx(), &call).await;

        let events = observer.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].phase, ToolPhase::Start);
        assert_eq!(events[0].correlation_id, "corr-7");
        assert!(events[0].payload.contains("ping"));
        assert_eq!(events[1].phase, ToolPhase::End);
        assert_eq!(events[1].payload, "ping");
    }

    #[test]
    fn tool_is_object_safe() {
        fn _assert_object_safe(_: &dyn Tool) {}
    }
}
