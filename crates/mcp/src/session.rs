//! Tool sessions: one live connection to one tool-provider process.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result, ToolError};
use crate::protocol::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, ListToolsParams,
    ListToolsResult, Tool,
};
use crate::transport::{RequestError, Transport};

/// Default timeout for the handshake and tool listing.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default timeout for a single tool call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on `tools/list` pages, against providers that never stop paging.
const MAX_LIST_PAGES: usize = 64;

/// Launch specification for a tool-provider process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

/// Timeouts applied by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub handshake_timeout: Duration,
    pub call_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// Identity of a tool session, unique per engine run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a session's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Ready,
    Failed,
    Closed,
}

/// A tool advertised by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameter_schema: Value,
}

impl From<Tool> for ToolDescriptor {
    fn from(tool: Tool) -> Self {
        Self {
            name: tool.name,
            description: tool.description.unwrap_or_default(),
            parameter_schema: tool.input_schema,
        }
    }
}

/// One live connection to a tool provider.
///
/// Calls are serialized: a provider sees at most one request in flight from
/// this session at a time.
pub struct ToolSession {
    id: SessionId,
    name: String,
    transport: Transport,
    child: Mutex<Option<Child>>,
    tools: Vec<ToolDescriptor>,
    instructions: Option<String>,
    options: SessionOptions,
    state: StdMutex<ConnectionState>,
    call_lock: Mutex<()>,
    closed: AtomicBool,
}

impl ToolSession {
    /// Spawn a provider process, perform the handshake and cache its tools.
    pub async fn connect(config: &ServerConfig, options: SessionOptions) -> Result<Self> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &config.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            server: config.name.clone(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or_else(|| Error::Connection {
            server: config.name.clone(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| Error::Connection {
            server: config.name.clone(),
            reason: "failed to capture stdout".into(),
        })?;

        debug!(server = %config.name, command = %config.command, "spawned tool provider");
        Self::establish(&config.name, Box::new(stdout), Box::new(stdin), Some(child), options).await
    }

    /// Perform the handshake over an already-open byte stream.
    pub async fn over_stream<R, W>(
        name: impl Into<String>,
        reader: R,
        writer: W,
        options: SessionOptions,
    ) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::establish(&name.into(), Box::new(reader), Box::new(writer), None, options).await
    }

    async fn establish(
        name: &str,
        reader: crate::transport::BoxedReader,
        writer: crate::transport::BoxedWriter,
        child: Option<Child>,
        options: SessionOptions,
    ) -> Result<Self> {
        let mut session = Self {
            id: SessionId::new(),
            name: name.to_string(),
            transport: Transport::start(name, reader, writer),
            child: Mutex::new(child),
            tools: Vec::new(),
            instructions: None,
            options,
            state: StdMutex::new(ConnectionState::Connecting),
            call_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        };

        let handshake = tokio::time::timeout(options.handshake_timeout, session.handshake()).await;
        let outcome = match handshake {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::HandshakeTimeout {
                server: name.to_string(),
                timeout: options.handshake_timeout,
            }),
        };

        match outcome {
            Ok((instructions, tools)) => {
                session.instructions = instructions;
                session.tools = tools;
                session.set_state(ConnectionState::Ready);
                info!(
                    server = %session.name,
                    session = %session.id,
                    tools = session.tools.len(),
                    "tool session ready"
                );
                Ok(session)
            }
            Err(e) => {
                session.set_state(ConnectionState::Failed);
                session.release().await;
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<(Option<String>, Vec<ToolDescriptor>)> {
        // The outer handshake deadline bounds the whole exchange.
        let limit = self.options.handshake_timeout;

        let params = serde_json::to_value(InitializeParams::default())
            .map_err(|e| self.protocol_error("initialize request", e.to_string()))?;
        let raw = self
            .transport
            .request("initialize", Some(params), limit)
            .await
            .map_err(|e| self.handshake_error("initialize result", e))?;
        let init: InitializeResult = serde_json::from_value(raw)
            .map_err(|e| self.protocol_error("initialize result", e.to_string()))?;
        debug!(
            server = %self.name,
            remote = %init.server_info.name,
            protocol = %init.protocol_version,
            "tool provider initialized"
        );

        self.transport
            .notify("notifications/initialized", None)
            .await
            .map_err(|e| self.handshake_error("initialized notification", e))?;

        let tools = self.list_remote_tools(limit).await?;
        Ok((init.instructions, tools))
    }

    async fn list_remote_tools(&self, limit: Duration) -> Result<Vec<ToolDescriptor>> {
        let mut tools = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = serde_json::to_value(ListToolsParams { cursor })
                .map_err(|e| self.protocol_error("tool listing request", e.to_string()))?;
            let raw = self
                .transport
                .request("tools/list", Some(params), limit)
                .await
                .map_err(|e| self.handshake_error("tool listing", e))?;
            let page: ListToolsResult = serde_json::from_value(raw)
                .map_err(|e| self.protocol_error("tool listing", e.to_string()))?;

            for tool in page.tools {
                if tool.name.trim().is_empty() {
                    return Err(self.protocol_error("tool listing", "tool with empty name"));
                }
                if !seen.insert(tool.name.clone()) {
                    return Err(self.protocol_error(
                        "tool listing",
                        format!("duplicate tool name '{}'", tool.name),
                    ));
                }
                tools.push(ToolDescriptor::from(tool));
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(tools),
            }
        }

        Err(self.protocol_error("tool listing", "too many pages"))
    }

    /// Session identity.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Configured provider name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Usage instructions the provider sent during the handshake, if any.
    pub fn instructions(&self) -> Option<&str> {
        self.instructions.as_deref()
    }

    /// Tools discovered during the handshake. Never re-queries the provider.
    pub fn list_tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        let state = *self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state == ConnectionState::Ready && !self.transport.is_alive() {
            ConnectionState::Failed
        } else {
            state
        }
    }

    /// Call a tool on this provider.
    ///
    /// A timeout leaves the session usable; a lost transport marks it failed.
    pub async fn invoke(
        &self,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> std::result::Result<CallToolResult, ToolError> {
        if self.state() != ConnectionState::Ready {
            return Err(ToolError::Disconnected { tool: tool.to_string() });
        }

        let limit = self.options.call_timeout;
        let params = serde_json::to_value(CallToolParams {
            name: tool.to_string(),
            arguments,
        })
        .map_err(|e| ToolError::InvalidArguments {
            tool: tool.to_string(),
            reason: e.to_string(),
        })?;

        // Queued calls wait here; the deadline starts once this call is sent.
        let _serialized = self.call_lock.lock().await;
        debug!(server = %self.name, tool, "invoking tool");
        let raw = self
            .transport
            .request("tools/call", Some(params), limit)
            .await
            .map_err(|e| self.call_error(tool, e))?;

        let result: CallToolResult =
            serde_json::from_value(raw).map_err(|e| ToolError::Failed {
                tool: tool.to_string(),
                message: format!("malformed tool result: {e}"),
            })?;

        if result.is_error {
            return Err(ToolError::Failed {
                tool: tool.to_string(),
                message: result.render(),
            });
        }

        Ok(result)
    }

    /// Terminate the provider and release the transport.
    ///
    /// Safe to call from several shutdown paths; only the first call acts.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(ConnectionState::Closed);
        self.release().await;
        info!(server = %self.name, session = %self.id, "tool session closed");
    }

    async fn release(&self) {
        self.transport.close().await;
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!(server = %self.name, error = %e, "provider process already exited");
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *state != ConnectionState::Closed {
            *state = next;
        }
    }

    fn call_error(&self, tool: &str, error: RequestError) -> ToolError {
        match error {
            RequestError::Timeout => {
                warn!(server = %self.name, tool, timeout = ?self.options.call_timeout, "tool call timed out");
                ToolError::Timeout {
                    tool: tool.to_string(),
                    timeout: self.options.call_timeout,
                }
            }
            RequestError::Disconnected => {
                warn!(server = %self.name, tool, "tool provider disconnected");
                self.set_state(ConnectionState::Failed);
                ToolError::Disconnected { tool: tool.to_string() }
            }
            RequestError::Rpc(e) => ToolError::Rpc {
                tool: tool.to_string(),
                code: e.code,
                message: e.message,
            },
            RequestError::Encode(e) => ToolError::InvalidArguments {
                tool: tool.to_string(),
                reason: e.to_string(),
            },
        }
    }

    fn handshake_error(&self, stage: &'static str, error: RequestError) -> Error {
        match error {
            RequestError::Timeout => Error::HandshakeTimeout {
                server: self.name.clone(),
                timeout: self.options.handshake_timeout,
            },
            RequestError::Disconnected => Error::Connection {
                server: self.name.clone(),
                reason: "provider closed the connection during the handshake".into(),
            },
            RequestError::Rpc(e) => self.protocol_error(stage, e.to_string()),
            RequestError::Encode(e) => self.protocol_error(stage, e.to_string()),
        }
    }

    fn protocol_error(&self, stage: &'static str, reason: impl Into<String>) -> Error {
        Error::Protocol {
            server: self.name.clone(),
            stage,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Debug for ToolSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSession")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("tools", &self.tools.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeProvider, FakeReply};
    use serde_json::json;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn server_config_defaults() {
        let config: ServerConfig = serde_json::from_value(json!({
            "name": "fs",
            "command": "mcp-server-filesystem"
        }))
        .unwrap();
        assert!(config.args.is_empty());
        assert!(config.env.is_empty());
        assert!(config.cwd.is_none());
    }

    #[tokio::test]
    async fn handshake_caches_tools() {
        let provider = FakeProvider::new()
            .tool("read_file", "Read a file", |_| FakeReply::text("hello"))
            .tool("list_directory", "List a directory", |_| FakeReply::text("a\nb"));
        let session = provider.connect("fs", SessionOptions::default()).await.unwrap();

        assert_eq!(session.state(), ConnectionState::Ready);
        let names: Vec<_> = session.list_tools().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["read_file", "list_directory"]);
        assert_eq!(session.list_tools()[0].description, "Read a file");
    }

    #[tokio::test]
    async fn invoke_returns_content() {
        let provider = FakeProvider::new().tool("echo", "Echo", |args| {
            FakeReply::text(args["message"].as_str().unwrap_or_default())
        });
        let session = provider.connect("echo", SessionOptions::default()).await.unwrap();

        let result = session.invoke("echo", args(json!({"message": "hi"}))).await.unwrap();
        assert_eq!(result.render(), "hi");
    }

    #[tokio::test]
    async fn timeout_keeps_session_ready() {
        let provider = FakeProvider::new()
            .tool("slow", "Slow", |_| FakeReply::Delay(Duration::from_millis(500), "late".into()))
            .tool("fast", "Fast", |_| FakeReply::text("ok"));
        let options = SessionOptions {
            call_timeout: Duration::from_millis(100),
            ..SessionOptions::default()
        };
        let session = provider.connect("mixed", options).await.unwrap();

        let err = session.invoke("slow", Map::new()).await.unwrap_err();
        assert_eq!(err.kind(), crate::ToolErrorKind::Timeout);
        assert_eq!(session.state(), ConnectionState::Ready);

        let result = session.invoke("fast", Map::new()).await.unwrap();
        assert_eq!(result.render(), "ok");
    }

    #[tokio::test]
    async fn provider_exit_marks_session_failed() {
        let provider = FakeProvider::new().tool("crash", "Crash", |_| FakeReply::Exit);
        let session = provider.connect("crashy", SessionOptions::default()).await.unwrap();

        let err = session.invoke("crash", Map::new()).await.unwrap_err();
        assert_eq!(err, ToolError::Disconnected { tool: "crash".into() });
        assert_eq!(session.state(), ConnectionState::Failed);

        let again = session.invoke("crash", Map::new()).await.unwrap_err();
        assert_eq!(again.kind(), crate::ToolErrorKind::Disconnected);
    }

    #[tokio::test]
    async fn error_results_become_tool_errors() {
        let provider = FakeProvider::new()
            .tool("denied", "Denied", |_| FakeReply::Error("access denied".into()))
            .tool("broken", "Broken", |_| FakeReply::Rpc(-32602, "bad params".into()));
        let session = provider.connect("errs", SessionOptions::default()).await.unwrap();

        let failed = session.invoke("denied", Map::new()).await.unwrap_err();
        assert_eq!(
            failed,
            ToolError::Failed {
                tool: "denied".into(),
                message: "access denied".into()
            }
        );
        let rpc = session.invoke("broken", Map::new()).await.unwrap_err();
        assert!(matches!(rpc, ToolError::Rpc { code: -32602, .. }));
        assert_eq!(session.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn malformed_listing_is_protocol_error() {
        let provider = FakeProvider::new().malformed_listing();
        let err = provider.connect("bad", SessionOptions::default()).await.unwrap_err();
        assert!(err.is_protocol(), "{err}");
        assert_eq!(err.server(), "bad");
    }

    #[tokio::test]
    async fn silent_provider_times_out_handshake() {
        let provider = FakeProvider::new().silent();
        let options = SessionOptions {
            handshake_timeout: Duration::from_millis(100),
            ..SessionOptions::default()
        };
        let err = provider.connect("mute", options).await.unwrap_err();
        assert!(matches!(err, Error::HandshakeTimeout { .. }));
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let config = ServerConfig {
            name: "ghost".into(),
            command: "definitely-not-a-real-mcp-server-binary".into(),
            ..ServerConfig::default()
        };
        let err = ToolSession::connect(&config, SessionOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
        assert!(!err.is_protocol());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let provider = FakeProvider::new().tool("noop", "Noop", |_| FakeReply::text(""));
        let handle = provider.handle();
        let session = provider.connect("noop", SessionOptions::default()).await.unwrap();

        session.close().await;
        session.close().await;
        assert_eq!(session.state(), ConnectionState::Closed);

        let err = session.invoke("noop", Map::new()).await.unwrap_err();
        assert_eq!(err.kind(), crate::ToolErrorKind::Disconnected);
        assert_eq!(handle.calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_calls_are_serialized() {
        let provider = FakeProvider::new().tool("work", "Work", |_| {
            FakeReply::Delay(Duration::from_millis(30), "done".into())
        });
        let handle = provider.handle();
        let session = provider.connect("serial", SessionOptions::default()).await.unwrap();

        let (a, b) = tokio::join!(
            session.invoke("work", Map::new()),
            session.invoke("work", Map::new())
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(handle.calls(), 2);
        assert_eq!(handle.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn queued_call_gets_its_own_deadline() {
        let provider = FakeProvider::new().tool("work", "Work", |_| {
            FakeReply::Delay(Duration::from_millis(70), "done".into())
        });
        let handle = provider.handle();
        let options = SessionOptions {
            call_timeout: Duration::from_millis(100),
            ..SessionOptions::default()
        };
        let session = provider.connect("queued", options).await.unwrap();

        let (first, second) = tokio::join!(
            session.invoke("work", Map::new()),
            session.invoke("work", Map::new())
        );
        assert_eq!(first.unwrap().render(), "done");
        assert_eq!(second.unwrap().render(), "done");
        assert_eq!(handle.calls(), 2);
    }
}
