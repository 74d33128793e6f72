//! # council-core
//!
//! Multi-agent orchestration over a retrieval-augmented document store.
//! Agents are LLM personas with their own stores and tools; they call each
//! other and run flows (ordered agent pipelines) through tool calls, while a
//! single orchestrator-wide write lock keeps document mutations exclusive.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use council_core::orchestrator::*;
//! use council_core::provider::OpenAIClient;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> council_core::CouncilResult<()> {
//! let config = OrchestratorConfig::default()
//!     .with_store(StoreDefinition::new("docs", "sqlite:docs.db"))
//!     .with_agent(
//!         AgentDefinition::new("writer", "You write concise technical notes.")
//!             .with_store(StoreRef::writable("docs"))
//!             .coder(),
//!     )
//!     .with_agent(
//!         AgentDefinition::new("reviewer", "You review notes for accuracy.")
//!             .with_store(StoreRef::read_only("docs")),
//!     )
//!     .with_flow(FlowDefinition::new("draft", ["writer", "reviewer"]));
//!
//! let client = Arc::new(OpenAIClient::new(std::env::var("OPENAI_API_KEY").unwrap_or_default(), "gpt-4o"));
//! let orchestrator = Orchestrator::builder(config, client).build().await?;
//!
//! let answer = orchestrator
//!     .call_flow("draft", "Document the retry policy", None, &CancellationToken::new())
//!     .await?;
//! println!("{answer}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`types`] | Core types: `Message`, `Role`, `ContentBlock`, `ToolCall`, `ToolDefinition`, `FinishReason` |
//! | [`provider`] | `LlmClient` contract and an OpenAI-compatible HTTP client with SSE streaming |
//! | [`chat`] | Chat interaction loop: request / tool / request until stop, streaming reassembly |
//! | [`tool`] | Async tool trait, first-wins registry, progress observer |
//! | [`history`] | Shared correlated conversation history with an optional JSONL log |
//! | [`store`] | Chunked, checksum-gated document store over memory, file, SQLite, Postgres and pgvector |
//! | [`context`] | Retrieval-context assembly: history window, grounding, persona, request |
//! | [`orchestrator`] | Agents, flows, built-in tools, write lock, call scope |
//! | [`subagent`] | Stateless single-turn subagents |
//! | [`exec`] | Cancellable external processes, killed by process group |
//! | [`error`] | Error types with thiserror |

pub mod chat;
pub mod context;
pub mod error;
pub mod exec;
pub mod history;
pub mod orchestrator;
pub mod provider;
pub mod store;
pub mod subagent;
pub mod tool;
pub mod types;

pub use error::{CouncilError, CouncilResult};
pub use types::*;
