//! MCP error types.

use std::time::Duration;
use thiserror::Error;

/// Errors establishing a tool session.
///
/// Every variant is fatal to the one session being connected; callers that
/// manage several providers carry on with the rest.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to spawn tool provider '{server}': {source}")]
    Spawn {
        server: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to tool provider '{server}' failed: {reason}")]
    Connection { server: String, reason: String },

    #[error("tool provider '{server}' did not finish the handshake within {timeout:?}")]
    HandshakeTimeout { server: String, timeout: Duration },

    #[error("tool provider '{server}' sent a malformed {stage}: {reason}")]
    Protocol {
        server: String,
        stage: &'static str,
        reason: String,
    },
}

impl Error {
    /// Whether the failure was a malformed exchange rather than a broken
    /// connection.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol { .. })
    }

    /// Name of the provider the error refers to.
    pub fn server(&self) -> &str {
        match self {
            Self::Spawn { server, .. }
            | Self::Connection { server, .. }
            | Self::HandshakeTimeout { server, .. }
            | Self::Protocol { server, .. } => server,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Errors from a single tool invocation.
///
/// These never tear down a conversation: the orchestrator reports them back
/// to the model as the call's result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("tool '{tool}' timed out after {}ms", .timeout.as_millis())]
    Timeout { tool: String, timeout: Duration },

    #[error("tool provider for '{tool}' is disconnected")]
    Disconnected { tool: String },

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("tool '{tool}' returned JSON-RPC error {code}: {message}")]
    Rpc {
        tool: String,
        code: i64,
        message: String,
    },

    #[error("tool '{tool}' failed: {message}")]
    Failed { tool: String, message: String },

    #[error("invalid arguments for tool '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },
}

/// Discriminant of [`ToolError`], for matching without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolErrorKind {
    Timeout,
    Disconnected,
    UnknownTool,
    Rpc,
    Failed,
    InvalidArguments,
}

impl ToolError {
    pub fn kind(&self) -> ToolErrorKind {
        match self {
            Self::Timeout { .. } => ToolErrorKind::Timeout,
            Self::Disconnected { .. } => ToolErrorKind::Disconnected,
            Self::UnknownTool(_) => ToolErrorKind::UnknownTool,
            Self::Rpc { .. } => ToolErrorKind::Rpc,
            Self::Failed { .. } => ToolErrorKind::Failed,
            Self::InvalidArguments { .. } => ToolErrorKind::InvalidArguments,
        }
    }
}
