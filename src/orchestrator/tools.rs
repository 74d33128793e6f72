//! Built-in tools wired into every agent at build time.
//!
//! Each tool is a tagged variant resolved once when the agent is built:
//! per-store document tools, peer-agent tools and flow tools. Failures are
//! rendered as `Error: <message>` and write-lock conflicts as a plain
//! rejection, so nothing here ever aborts the calling turn.

use std::sync::{Arc, Weak};

use async_trait::async_trait;

use super::write_lock::{WriteLease, WriteMode};
use super::Orchestrator;
use crate::error::{CouncilError, CouncilResult};
use crate::store::{DocumentStore, ScoredResult};
use crate::tool::{Tool, ToolContext};
use crate::types::{ParameterType, ToolCall, ToolDefinition, ToolParameter};

const MAX_TOOL_NAME: usize = 64;

/// `prefix_target` with anything outside `[A-Za-z0-9_-]` replaced by `_`
pub fn tool_name(prefix: &str, target: &str) -> String {
    let mut name: String = format!("{prefix}_{target}")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    name.truncate(MAX_TOOL_NAME);
    name
}

pub(crate) fn required<'a>(call: &'a ToolCall, name: &str) -> CouncilResult<&'a str> {
    call.str_arg(name)
        .ok_or_else(|| anyhow::anyhow!("missing required argument '{name}'").into())
}

pub enum BuiltinKind {
    ListDocuments(Arc<DocumentStore>),
    SearchDocuments(Arc<DocumentStore>),
    ReadDocument(Arc<DocumentStore>),
    WriteDocument(Arc<DocumentStore>, WriteMode),
    DeleteDocument(Arc<DocumentStore>, WriteMode),
    AskAgent {
        caller: String,
        agent: String,
        description: String,
        coder: bool,
        orchestrator: Weak<Orchestrator>,
    },
    RunFlow {
        caller: String,
        flow: String,
        steps: Vec<String>,
        orchestrator: Weak<Orchestrator>,
    },
}

/// A built-in tool: its resolved name plus the variant that runs it
pub struct BuiltinTool {
    name: String,
    kind: BuiltinKind,
}

impl BuiltinTool {
    /// `list`, `search` and `read` always; `write` and `delete` when writable
    pub fn for_store(store: &Arc<DocumentStore>, writable: bool, write_mode: &WriteMode) -> Vec<Self> {
        let mut tools = vec![
            Self::new("list", store.name(), BuiltinKind::ListDocuments(store.clone())),
            Self::new("search", store.name(), BuiltinKind::SearchDocuments(store.clone())),
            Self::new("read", store.name(), BuiltinKind::ReadDocument(store.clone())),
        ];
        if writable {
            tools.push(Self::new(
                "write",
                store.name(),
                BuiltinKind::WriteDocument(store.clone(), write_mode.clone()),
            ));
            tools.push(Self::new(
                "delete",
                store.name(),
                BuiltinKind::DeleteDocument(store.clone(), write_mode.clone()),
            ));
        }
        tools
    }

    pub fn ask_agent(
        caller: &str,
        agent: &str,
        description: &str,
        coder: bool,
        orchestrator: Weak<Orchestrator>,
    ) -> Self {
        Self::new(
            "ask",
            agent,
            BuiltinKind::AskAgent {
                caller: caller.to_string(),
                agent: agent.to_string(),
                description: description.to_string(),
                coder,
                orchestrator,
            },
        )
    }

    pub fn run_flow(caller: &str, flow: &str, steps: &[String], orchestrator: Weak<Orchestrator>) -> Self {
        Self::new(
            "run_flow",
            flow,
            BuiltinKind::RunFlow {
                caller: caller.to_string(),
                flow: flow.to_string(),
                steps: steps.to_vec(),
                orchestrator,
            },
        )
    }

    fn new(prefix: &str, target: &str, kind: BuiltinKind) -> Self {
        Self {
            name: tool_name(prefix, target),
            kind,
        }
    }

    pub fn kind(&self) -> &BuiltinKind {
        &self.kind
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self.kind,
            BuiltinKind::WriteDocument(..) | BuiltinKind::DeleteDocument(..)
        )
    }

    async fn run(&self, ctx: &ToolContext, call: &ToolCall) -> CouncilResult<String> {
        match &self.kind {
            BuiltinKind::ListDocuments(store) => {
                let folder = call.str_arg("folder").unwrap_or("");
                let recursive = call.bool_arg("recursive").unwrap_or(true);
                let keys = store.list(folder, recursive).await?;
                if keys.is_empty() {
                    return Ok(format!("No documents found in store '{}'.", store.name()));
                }
                Ok(keys.join("\n"))
            }
            BuiltinKind::SearchDocuments(store) => {
                let query = required(call, "query")?;
                let hits = store.relevant_items(query, &ctx.cancel).await?;
                Ok(render_hits(store.name(), &hits))
            }
            BuiltinKind::ReadDocument(store) => {
                let key = required(call, "key")?;
                match store.get(key).await? {
                    Some(text) => Ok(text),
                    None => Err(CouncilError::Storage(format!(
                        "document '{key}' not found in store '{}'",
                        store.name()
                    ))),
                }
            }
            BuiltinKind::WriteDocument(store, write_mode) => {
                let key = required(call, "key")?;
                let content = required(call, "content")?;
                let split = call.bool_arg("split").unwrap_or(true);
                let _lease = match self.write_permit(ctx, write_mode) {
                    Ok(lease) => lease,
                    Err(rejection) => return Ok(rejection),
                };
                store.store(key, content, None, split, &ctx.cancel).await?;
                Ok(format!(
                    "Stored '{key}' in store '{}' ({} characters).",
                    store.name(),
                    content.chars().count()
                ))
            }
            BuiltinKind::DeleteDocument(store, write_mode) => {
                let key = required(call, "key")?;
                let _lease = match self.write_permit(ctx, write_mode) {
                    Ok(lease) => lease,
                    Err(rejection) => return Ok(rejection),
                };
                if store.get(key).await?.is_none() && store.get_parts(key).await?.is_none() {
                    return Err(CouncilError::Storage(format!(
                        "document '{key}' not found in store '{}'",
                        store.name()
                    )));
                }
                store.remove(key).await?;
                Ok(format!("Deleted '{key}' from store '{}'.", store.name()))
            }
            BuiltinKind::AskAgent {
                caller,
                agent,
                coder,
                orchestrator,
                ..
            } => {
                let query = required(call, "query")?;
                let orchestrator = upgrade(orchestrator)?;
                if *coder {
                    orchestrator
                        .coder_call(agent, query, Some(caller), &ctx.scope, &ctx.cancel)
                        .await
                } else {
                    orchestrator
                        .agent_call(agent, query, Some(caller), &ctx.scope, &ctx.cancel)
                        .await
                }
            }
            BuiltinKind::RunFlow {
                caller,
                flow,
                orchestrator,
                ..
            } => {
                let input = required(call, "input")?;
                upgrade(orchestrator)?
                    .flow_call(flow, input, Some(caller), &ctx.scope, &ctx.cancel)
                    .await
            }
        }
    }

    /// Writes inside a write-locked call proceed under that lock. Otherwise
    /// a short lease is taken for this one mutation, or the write is refused.
    fn write_permit(&self, ctx: &ToolContext, write_mode: &WriteMode) -> Result<Option<WriteLease>, String> {
        if ctx.scope.holds_lease() {
            return Ok(None);
        }
        match write_mode.try_acquire() {
            Some(lease) => Ok(Some(lease)),
            None => {
                tracing::info!(tool = %self.name, "write rejected, write mode held elsewhere");
                Err(format!(
                    "Write rejected: another agent is currently modifying documents, so '{}' cannot run now. Try again once that work has finished.",
                    self.name
                ))
            }
        }
    }
}

fn upgrade(orchestrator: &Weak<Orchestrator>) -> CouncilResult<Arc<Orchestrator>> {
    orchestrator
        .upgrade()
        .ok_or_else(|| anyhow::anyhow!("orchestrator is no longer running").into())
}

fn render_hits(store: &str, hits: &[ScoredResult]) -> String {
    if hits.is_empty() {
        return format!("No relevant documents found in store '{store}'.");
    }
    let mut out = String::new();
    for hit in hits {
        let source = hit.parent.as_deref().unwrap_or(&hit.key);
        out.push_str(&format!(
            "--- {source} ({}, score {:.3}) ---\n{}\n\n",
            hit.key,
            hit.score,
            hit.text.as_deref().unwrap_or_default()
        ));
    }
    out
}

#[async_trait]
impl Tool for BuiltinTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn definition(&self) -> ToolDefinition {
        let definition = ToolDefinition::new(&self.name, self.description());
        match &self.kind {
            BuiltinKind::ListDocuments(_) => definition
                .with_parameter(ToolParameter::optional(
                    "folder",
                    ParameterType::String,
                    "Folder prefix to list, empty for the whole store",
                ))
                .with_parameter(ToolParameter::optional(
                    "recursive",
                    ParameterType::Boolean,
                    "Include documents in nested folders (default true)",
                )),
            BuiltinKind::SearchDocuments(_) => definition.with_parameter(ToolParameter::required(
                "query",
                ParameterType::String,
                "What to look for",
            )),
            BuiltinKind::ReadDocument(_) => definition.with_parameter(ToolParameter::required(
                "key",
                ParameterType::String,
                "Document key, as returned by the list tool",
            )),
            BuiltinKind::WriteDocument(..) => definition
                .with_parameter(ToolParameter::required(
                    "key",
                    ParameterType::String,
                    "Document key, for example notes/plan.md",
                ))
                .with_parameter(ToolParameter::required(
                    "content",
                    ParameterType::String,
                    "The complete document content",
                ))
                .with_parameter(ToolParameter::optional(
                    "split",
                    ParameterType::Boolean,
                    "Split long documents into chunks (default true)",
                )),
            BuiltinKind::DeleteDocument(..) => definition.with_parameter(ToolParameter::required(
                "key",
                ParameterType::String,
                "Document key to delete",
            )),
            BuiltinKind::AskAgent { .. } => definition.with_parameter(ToolParameter::required(
                "query",
                ParameterType::String,
                "The request for the agent",
            )),
            BuiltinKind::RunFlow { .. } => definition.with_parameter(ToolParameter::required(
                "input",
                ParameterType::String,
                "Input for the first step of the flow",
            )),
        }
    }

    async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> String {
        match self.run(ctx, call).await {
            Ok(text) => text,
            Err(e) => {
                tracing::debug!(tool = %self.name, error = %e, "tool failed");
                format!("Error: {e}")
            }
        }
    }
}

impl BuiltinTool {
    fn description(&self) -> String {
        match &self.kind {
            BuiltinKind::ListDocuments(store) => {
                format!("List the documents in the '{}' store.", store.name())
            }
            BuiltinKind::SearchDocuments(store) => format!(
                "Search the '{}' store for the passages most relevant to a query.",
                store.name()
            ),
            BuiltinKind::ReadDocument(store) => {
                format!("Read the full text of a document in the '{}' store.", store.name())
            }
            BuiltinKind::WriteDocument(store, _) => format!(
                "Create or replace a document in the '{}' store. Always send the whole document.",
                store.name()
            ),
            BuiltinKind::DeleteDocument(store, _) => {
                format!("Delete a document from the '{}' store.", store.name())
            }
            BuiltinKind::AskAgent {
                agent, description, ..
            } => {
                if description.is_empty() {
                    format!("Ask the '{agent}' agent to handle a request and return its answer.")
                } else {
                    format!("Ask the '{agent}' agent: {description}")
                }
            }
            BuiltinKind::RunFlow { flow, steps, .. } => format!(
                "Run the '{flow}' flow ({}); each step receives the previous step's output.",
                steps.join(" -> ")
            ),
        }
    }
}
