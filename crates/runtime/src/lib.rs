//! Conduit runtime: conversation state, tool registry, model backends and
//! the orchestration loop that ties them together.
//!
//! # Overview
//!
//! - **Conversation**: the append-only transcript of one chat.
//! - **ToolRegistry**: every connected tool provider behind one name space.
//! - **BackendAdapter**: a trait translating the transcript to and from one
//!   model API (Anthropic, Ollama, Cohere, or a JSON-directive agent over a
//!   chat completions endpoint).
//! - **Orchestrator**: runs a turn, resolving tool calls until the model
//!   answers or the round limit is reached.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use runtime::{Conversation, OllamaBackend, Orchestrator, ToolRegistry};
//! use mcp::{ServerConfig, SessionOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> runtime::Result<()> {
//! let servers = vec![ServerConfig {
//!     name: "filesystem".into(),
//!     command: "npx".into(),
//!     args: vec!["-y".into(), "@modelcontextprotocol/server-filesystem".into(), ".".into()],
//!     ..ServerConfig::default()
//! }];
//! let (registry, _report) = ToolRegistry::connect_all(&servers, SessionOptions::default()).await;
//! let registry = Arc::new(registry);
//!
//! let backend = OllamaBackend::builder("qwen3:8b").build();
//! let orchestrator = Orchestrator::new(backend, Arc::clone(&registry));
//!
//! let mut conversation = Conversation::new();
//! let reply = orchestrator
//!     .run_turn(&mut conversation, "What files are here?", &CancellationToken::new())
//!     .await?;
//! println!("{}", reply.text);
//!
//! registry.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod conversation;
mod error;
pub mod model;
mod orchestrator;
pub mod providers;
mod tools;

pub use conversation::Conversation;
pub use error::{Result, TurnError};
pub use model::{BackendError, DecodedReply, Message, Part, Role, ToolCallRequest, ToolResult};
pub use orchestrator::{DEFAULT_MAX_ROUNDS, Orchestrator, Reply, ToolCallObserver};
pub use providers::{
    AnthropicAuth, AnthropicBackend, BackendAdapter, CohereBackend, DEFAULT_BACKEND_TIMEOUT,
    DirectiveBackend, OllamaBackend, ProbeReport,
};
pub use tools::{ConnectReport, Registration, RegistryEntry, Shadowed, ToolRegistry};
