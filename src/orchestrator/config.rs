use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::chat::ChatConfig;
use crate::context::ContextConfig;
use crate::error::{CouncilError, CouncilResult};
use crate::store::{ChunkPolicy, RetrievalConfig};

fn default_connection() -> String {
    "memory:".into()
}

fn default_max_call_depth() -> usize {
    8
}

/// A named document store and its backend connection spec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreDefinition {
    pub name: String,
    /// `memory:`, `sqlite:<path>`, `postgres:<dsn>`, `pgvector:<dsn>` or a folder path
    #[serde(default = "default_connection")]
    pub connection: String,
}

impl StoreDefinition {
    pub fn new(name: impl Into<String>, connection: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection: connection.into(),
        }
    }
}

/// An agent's reference to a store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRef {
    pub store: String,
    #[serde(default)]
    pub writable: bool,
}

impl StoreRef {
    pub fn read_only(store: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            writable: false,
        }
    }

    pub fn writable(store: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            writable: true,
        }
    }
}

/// Optional tool families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    VersionControl,
    Build,
    Email,
    Warehouse,
    Delegation,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::VersionControl,
        Capability::Build,
        Capability::Email,
        Capability::Warehouse,
        Capability::Delegation,
    ];
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Capability::VersionControl => "version_control",
            Capability::Build => "build",
            Capability::Email => "email",
            Capability::Warehouse => "warehouse",
            Capability::Delegation => "delegation",
        };
        f.write_str(name)
    }
}

/// Capability flags of one agent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub version_control: bool,
    #[serde(default)]
    pub build: bool,
    #[serde(default)]
    pub email: bool,
    #[serde(default)]
    pub warehouse: bool,
    #[serde(default)]
    pub delegation: bool,
}

impl Capabilities {
    pub fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::VersionControl => self.version_control,
            Capability::Build => self.build,
            Capability::Email => self.email,
            Capability::Warehouse => self.warehouse,
            Capability::Delegation => self.delegation,
        }
    }

    pub fn enabled(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|c| self.has(*c))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub persona: String,
    /// First writable store is the primary, the rest are auxiliary
    #[serde(default)]
    pub stores: Vec<StoreRef>,
    #[serde(default)]
    pub capabilities: Capabilities,
    /// Peer agents this agent may call
    #[serde(default)]
    pub agents: Vec<String>,
    #[serde(default)]
    pub flows: Vec<String>,
    /// Coder agents run under the write lock and must emit whole files
    #[serde(default)]
    pub coder: bool,
    #[serde(default)]
    pub include_file_listing: bool,
}

impl AgentDefinition {
    pub fn new(name: impl Into<String>, persona: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            persona: persona.into(),
            stores: Vec::new(),
            capabilities: Capabilities::default(),
            agents: Vec::new(),
            flows: Vec::new(),
            coder: false,
            include_file_listing: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_store(mut self, store: StoreRef) -> Self {
        self.stores.push(store);
        self
    }

    pub fn with_peer(mut self, agent: impl Into<String>) -> Self {
        self.agents.push(agent.into());
        self
    }

    pub fn with_flow(mut self, flow: impl Into<String>) -> Self {
        self.flows.push(flow.into());
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn coder(mut self) -> Self {
        self.coder = true;
        self
    }

    pub fn with_file_listing(mut self) -> Self {
        self.include_file_listing = true;
        self
    }

    /// Store names with the primary first
    pub fn store_order(&self) -> Vec<&StoreRef> {
        let primary = self.stores.iter().position(|s| s.writable).unwrap_or(0);
        let mut ordered: Vec<&StoreRef> = Vec::with_capacity(self.stores.len());
        if let Some(first) = self.stores.get(primary) {
            ordered.push(first);
        }
        ordered.extend(
            self.stores
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != primary)
                .map(|(_, s)| s),
        );
        ordered
    }
}

/// A named pipeline of agents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub name: String,
    pub agents: Vec<String>,
}

impl FlowDefinition {
    pub fn new<I, S>(name: impl Into<String>, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            agents: agents.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub stores: Vec<StoreDefinition>,
    #[serde(default)]
    pub agents: Vec<AgentDefinition>,
    #[serde(default)]
    pub flows: Vec<FlowDefinition>,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub chunking: ChunkPolicy,
    #[serde(default)]
    pub context: ContextConfig,
    /// Nesting limit for agent and flow calls
    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: usize,
    /// JSONL file mirroring the shared history
    #[serde(default)]
    pub history_log: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stores: Vec::new(),
            agents: Vec::new(),
            flows: Vec::new(),
            chat: ChatConfig::default(),
            retrieval: RetrievalConfig::default(),
            chunking: ChunkPolicy::default(),
            context: ContextConfig::default(),
            max_call_depth: default_max_call_depth(),
            history_log: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_store(mut self, store: StoreDefinition) -> Self {
        self.stores.push(store);
        self
    }

    pub fn with_agent(mut self, agent: AgentDefinition) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn with_flow(mut self, flow: FlowDefinition) -> Self {
        self.flows.push(flow);
        self
    }

    /// Check every cross reference. `extra_stores` are stores supplied
    /// directly to the builder rather than defined here.
    pub fn validate(&self, extra_stores: &[&str]) -> CouncilResult<()> {
        let stores = unique_names(self.stores.iter().map(|s| s.name.as_str()), "store")?;
        let agents = unique_names(self.agents.iter().map(|a| a.name.as_str()), "agent")?;
        let flows = unique_names(self.flows.iter().map(|f| f.name.as_str()), "flow")?;

        for agent in &self.agents {
            for store in &agent.stores {
                if !stores.contains(store.store.as_str())
                    && !extra_stores.contains(&store.store.as_str())
                {
                    return Err(CouncilError::Config(format!(
                        "agent '{}' references unknown store '{}'",
                        agent.name, store.store
                    )));
                }
            }
            for peer in &agent.agents {
                if !agents.contains(peer.as_str()) {
                    return Err(CouncilError::Config(format!(
                        "agent '{}' references unknown agent '{peer}'",
                        agent.name
                    )));
                }
            }
            for flow in &agent.flows {
                if !flows.contains(flow.as_str()) {
                    return Err(CouncilError::Config(format!(
                        "agent '{}' references unknown flow '{flow}'",
                        agent.name
                    )));
                }
            }
        }

        for flow in &self.flows {
            if flow.agents.is_empty() {
                return Err(CouncilError::Config(format!("flow '{}' has no steps", flow.name)));
            }
            if let Some(step) = flow.agents.iter().find(|a| !agents.contains(a.as_str())) {
                return Err(CouncilError::Config(format!(
                    "flow '{}' references unknown agent '{step}'",
                    flow.name
                )));
            }
        }

        if self.max_call_depth == 0 {
            return Err(CouncilError::Config("max_call_depth must be at least 1".into()));
        }
        Ok(())
    }
}

fn unique_names<'a>(
    names: impl Iterator<Item = &'a str>,
    kind: &str,
) -> CouncilResult<HashSet<&'a str>> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(CouncilError::Config(format!("duplicate {kind} name '{name}'")));
        }
    }
    Ok(seen)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_store(StoreDefinition::new("docs", "memory:"))
            .with_agent(
                AgentDefinition::new("writer", "You write.")
                    .with_store(StoreRef::writable("docs"))
                    .with_peer("reviewer"),
            )
            .with_agent(AgentDefinition::new("reviewer", "You review."))
            .with_flow(FlowDefinition::new("draft", ["writer", "reviewer"]))
    }

    #[test]
    fn valid_config_passes() {
        base().validate(&[]).unwrap();
    }

    #[test]
    fn unknown_peer_is_config_error() {
        let config = base().with_agent(AgentDefinition::new("lonely", "").with_peer("ghost"));
        let err = config.validate(&[]).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn unknown_flow_step_is_config_error() {
        let config = base().with_flow(FlowDefinition::new("broken", ["writer", "ghost"]));
        assert!(matches!(config.validate(&[]), Err(CouncilError::Config(_))));
    }

    #[test]
    fn unknown_flow_reference_is_config_error() {
        let config = base().with_agent(AgentDefinition::new("runner", "").with_flow("nope"));
        assert!(matches!(config.validate(&[]), Err(CouncilError::Config(_))));
    }

    #[test]
    fn extra_stores_satisfy_references() {
        let config = base().with_agent(
            AgentDefinition::new("archivist", "").with_store(StoreRef::read_only("external")),
        );
        assert!(config.validate(&[]).is_err());
        config.validate(&["external"]).unwrap();
    }

    #[test]
    fn duplicate_agent_is_rejected() {
        let config = base().with_agent(AgentDefinition::new("writer", ""));
        assert!(config.validate(&[]).unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn primary_store_comes_first() {
        let agent = AgentDefinition::new("a", "")
            .with_store(StoreRef::read_only("ref"))
            .with_store(StoreRef::writable("work"));
        let order: Vec<&str> = agent.store_order().iter().map(|s| s.store.as_str()).collect();
        assert_eq!(order, vec!["work", "ref"]);
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let config: OrchestratorConfig = serde_json::from_str(
            r#"{"agents":[{"name":"solo","capabilities":{"delegation":true}}]}"#,
        )
        .unwrap();
        assert_eq!(config.max_call_depth, 8);
        assert_eq!(config.chat.max_tool_rounds, 10);
        assert_eq!(config.retrieval.token_budget, 2000);
        assert_eq!(config.context.history_cap, 20);
        let enabled: Vec<Capability> = config.agents[0].capabilities.enabled().collect();
        assert_eq!(enabled, vec![Capability::Delegation]);
    }
}
