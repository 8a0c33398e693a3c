//! MCP (Model Context Protocol) client library.
//!
//! This crate owns the connection to tool-provider processes: it spawns a
//! server, speaks newline-delimited JSON-RPC over its stdio, performs the
//! handshake, caches the advertised tools and invokes them with per-call
//! timeouts.
//!
//! # Example
//!
//! ```no_run
//! use mcp::{ServerConfig, SessionOptions, ToolSession};
//!
//! # async fn example() -> mcp::Result<()> {
//! let config = ServerConfig {
//!     name: "filesystem".to_string(),
//!     command: "mcp-server-filesystem".to_string(),
//!     args: vec!["./workspace".to_string()],
//!     ..ServerConfig::default()
//! };
//!
//! let session = ToolSession::connect(&config, SessionOptions::default()).await?;
//! for tool in session.list_tools() {
//!     println!("Tool: {}", tool.name);
//! }
//!
//! let mut arguments = serde_json::Map::new();
//! arguments.insert("path".into(), "./README.md".into());
//! match session.invoke("read_file", arguments).await {
//!     Ok(result) => println!("{}", result.render()),
//!     Err(e) => eprintln!("{e}"),
//! }
//!
//! session.close().await;
//! # Ok(())
//! # }
//! ```

mod error;
mod protocol;
mod session;
mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

pub use error::{Error, Result, ToolError, ToolErrorKind};
pub use protocol::{
    CallToolResult, EmbeddedResource, InitializeResult, JsonRpcError, PROTOCOL_VERSION, RequestId,
    ServerInfo, Tool, ToolContent,
};
pub use session::{
    ConnectionState, DEFAULT_CALL_TIMEOUT, DEFAULT_TIMEOUT, ServerConfig, SessionId,
    SessionOptions, ToolDescriptor, ToolSession,
};
pub use transport::MAX_OUTPUT_SIZE;
