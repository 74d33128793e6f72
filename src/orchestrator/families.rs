//! Optional tool families, switched on per agent by capability flags.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::config::AgentDefinition;
use super::tools::{required, tool_name};
use crate::error::CouncilResult;
use crate::exec::{CommandRequest, CommandRunner};
use crate::provider::LlmClient;
use crate::subagent::{SubagentConfig, SubagentSpawner};
use crate::tool::{Tool, ToolContext};
use crate::types::{ParameterType, ToolCall, ToolDefinition, ToolParameter};

const DELEGATE_PROMPT: &str = "You are a focused assistant working on a single delegated task. \
You have no tools and no memory beyond this message. Reply with the result only.";

/// A set of tools handed to every agent with the matching capability
pub trait ToolFamily: Send + Sync {
    fn name(&self) -> &str;

    fn tools(&self, agent: &AgentDefinition) -> Vec<Arc<dyn Tool>>;
}

// ─── Delegation ─────────────────────────────────────────────────────────────

/// Adds `delegate_task`, which hands work to a stateless single-turn subagent
pub struct DelegationFamily {
    spawner: Arc<SubagentSpawner>,
}

impl DelegationFamily {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self {
            spawner: Arc::new(SubagentSpawner::new(client)),
        }
    }
}

impl ToolFamily for DelegationFamily {
    fn name(&self) -> &str {
        "delegation"
    }

    fn tools(&self, agent: &AgentDefinition) -> Vec<Arc<dyn Tool>> {
        vec![Arc::new(DelegateTool {
            spawner: self.spawner.clone(),
            config: SubagentConfig::new(format!("{}-delegate", agent.name), DELEGATE_PROMPT),
        })]
    }
}

struct DelegateTool {
    spawner: Arc<SubagentSpawner>,
    config: SubagentConfig,
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        "delegate_task"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "delegate_task",
            "Hand a self-contained task to a helper with no tools and no history. Include everything it needs.",
        )
        .with_parameter(ToolParameter::required(
            "task",
            ParameterType::String,
            "What the helper should do",
        ))
        .with_parameter(ToolParameter::optional(
            "context",
            ParameterType::String,
            "Background material the helper needs",
        ))
    }

    async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> String {
        let result = async {
            let task = required(call, "task")?;
            self.spawner
                .delegate(&self.config, task, call.str_arg("context"), &ctx.cancel)
                .await
        }
        .await;

        match result {
            Ok(result) => result.content,
            Err(e) => format!("Error: {e}"),
        }
    }
}

// ─── Commands ───────────────────────────────────────────────────────────────

/// Wraps one configured executable as a tool, e.g. `git` for version control
/// or `cargo` for builds
#[derive(Clone)]
pub struct CommandFamily {
    tool: String,
    description: String,
    program: String,
    base_args: Vec<String>,
    cwd: Option<PathBuf>,
    timeout: Duration,
    runner: Arc<dyn CommandRunner>,
}

impl CommandFamily {
    /// The tool is named `run_<name>`
    pub fn new(name: &str, program: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        let program = program.into();
        Self {
            tool: tool_name("run", name),
            description: format!("Run `{program}` with the given arguments and return its output."),
            program,
            base_args: Vec::new(),
            cwd: None,
            timeout: Duration::from_secs(120),
            runner,
        }
    }

    /// Backed by real OS processes
    #[cfg(feature = "native")]
    pub fn native(name: &str, program: impl Into<String>) -> Self {
        Self::new(name, program, Arc::new(crate::exec::ProcessRunner::new()))
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Arguments placed before the model's own
    pub fn with_base_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn request(&self, args: Vec<String>) -> CommandRequest {
        let mut request = CommandRequest::new(&self.program)
            .args(self.base_args.iter().cloned())
            .args(args)
            .timeout(self.timeout);
        if let Some(cwd) = &self.cwd {
            request = request.cwd(cwd);
        }
        request
    }
}

impl ToolFamily for CommandFamily {
    fn name(&self) -> &str {
        &self.tool
    }

    fn tools(&self, _agent: &AgentDefinition) -> Vec<Arc<dyn Tool>> {
        vec![Arc::new(CommandTool(self.clone()))]
    }
}

struct CommandTool(CommandFamily);

/// Arguments as an array of strings, or one whitespace-separated string
fn command_args(call: &ToolCall) -> CouncilResult<Vec<String>> {
    match call.arguments.get("args") {
        Some(Value::Array(items)) => Ok(items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect()),
        Some(Value::String(line)) => Ok(line.split_whitespace().map(String::from).collect()),
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(other) => Err(anyhow::anyhow!("'args' must be a list of strings, got {other}").into()),
    }
}

#[async_trait]
impl Tool for CommandTool {
    fn name(&self) -> &str {
        &self.0.tool
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(&self.0.tool, &self.0.description).with_parameter(ToolParameter::optional(
            "args",
            ParameterType::Array,
            "Command-line arguments",
        ))
    }

    async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> String {
        let result = async {
            let request = self.0.request(command_args(call)?);
            tracing::info!(tool = %self.0.tool, command = %request.display(), "running command");
            self.0.runner.run(&request, &ctx.cancel).await
        }
        .await;

        match result {
            Ok(output) => output.render(),
            Err(e) => format!("Error: {e}"),
        }
    }
}
