//! Unified tool registry over every connected provider.

use std::collections::HashMap;

use futures::future::join_all;
use mcp::{CallToolResult, ServerConfig, SessionId, SessionOptions, ToolDescriptor, ToolError, ToolSession};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

/// A tool name claimed by more than one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shadowed {
    pub name: String,
    /// Provider whose tool stays active.
    pub kept: String,
    /// Provider whose tool was ignored.
    pub dropped: String,
}

/// What registering one session changed.
#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub server: String,
    pub registered: Vec<String>,
    pub shadowed: Vec<Shadowed>,
}

/// Outcome of connecting to a set of providers.
#[derive(Debug, Default)]
pub struct ConnectReport {
    pub registrations: Vec<Registration>,
    pub failures: Vec<mcp::Error>,
}

/// An active tool and the session that owns it.
#[derive(Debug, Clone, Copy)]
pub struct RegistryEntry<'a> {
    pub owner: SessionId,
    pub server: &'a str,
    pub descriptor: &'a ToolDescriptor,
}

/// Maps tool names to the sessions that serve them.
///
/// When two providers advertise the same name, the session registered first
/// keeps it; the later one is recorded as shadowed for the registry's
/// lifetime.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    sessions: Vec<ToolSession>,
    catalog: Vec<ToolDescriptor>,
    owners: Vec<usize>,
    index: HashMap<String, usize>,
    shadowed: Vec<Shadowed>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to every provider concurrently and register the ones that
    /// come up, in configuration order.
    pub async fn connect_all(configs: &[ServerConfig], options: SessionOptions) -> (Self, ConnectReport) {
        let attempts = join_all(configs.iter().map(|config| ToolSession::connect(config, options))).await;

        let mut registry = Self::new();
        let mut report = ConnectReport::default();
        for attempt in attempts {
            match attempt {
                Ok(session) => report.registrations.push(registry.register(session)),
                Err(e) => {
                    warn!(server = e.server(), error = %e, "tool provider unavailable");
                    report.failures.push(e);
                }
            }
        }
        (registry, report)
    }

    /// Add a session's tools. Names already taken stay with their owner.
    pub fn register(&mut self, session: ToolSession) -> Registration {
        let slot = self.sessions.len();
        let mut registration = Registration {
            server: session.name().to_string(),
            ..Registration::default()
        };

        for descriptor in session.list_tools() {
            if let Some(&existing) = self.index.get(&descriptor.name) {
                let kept = self.sessions[self.owners[existing]].name().to_string();
                warn!(
                    tool = %descriptor.name,
                    kept = %kept,
                    dropped = %session.name(),
                    "tool name already registered; keeping the first provider"
                );
                let shadowed = Shadowed {
                    name: descriptor.name.clone(),
                    kept,
                    dropped: session.name().to_string(),
                };
                self.shadowed.push(shadowed.clone());
                registration.shadowed.push(shadowed);
                continue;
            }
            self.index.insert(descriptor.name.clone(), self.catalog.len());
            self.catalog.push(descriptor.clone());
            self.owners.push(slot);
            registration.registered.push(descriptor.name.clone());
        }

        info!(
            server = %session.name(),
            tools = registration.registered.len(),
            shadowed = registration.shadowed.len(),
            "registered tool provider"
        );
        self.sessions.push(session);
        registration
    }

    /// The session serving `name`.
    pub fn resolve(&self, name: &str) -> Result<&ToolSession, ToolError> {
        self.index
            .get(name)
            .map(|&i| &self.sessions[self.owners[i]])
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))
    }

    /// Active tool descriptors in registration order.
    pub fn catalog(&self) -> &[ToolDescriptor] {
        &self.catalog
    }

    pub fn entries(&self) -> impl Iterator<Item = RegistryEntry<'_>> {
        self.catalog.iter().zip(&self.owners).map(|(descriptor, &slot)| {
            let session = &self.sessions[slot];
            RegistryEntry {
                owner: session.id(),
                server: session.name(),
                descriptor,
            }
        })
    }

    pub fn shadowed(&self) -> &[Shadowed] {
        &self.shadowed
    }

    pub fn sessions(&self) -> &[ToolSession] {
        &self.sessions
    }

    pub fn len(&self) -> usize {
        self.catalog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalog.is_empty()
    }

    /// Resolve and invoke a tool.
    pub async fn dispatch(&self, name: &str, arguments: &Value) -> Result<CallToolResult, ToolError> {
        let session = self.resolve(name)?;
        let arguments = argument_map(name, arguments)?;
        debug!(tool = name, server = %session.name(), "dispatching tool call");
        session.invoke(name, arguments).await
    }

    /// Close every session.
    pub async fn shutdown(&self) {
        join_all(self.sessions.iter().map(ToolSession::close)).await;
    }
}

/// Tool arguments as a JSON object.
///
/// Backends that send arguments as a JSON-encoded string are accepted, and a
/// missing value means no arguments.
fn argument_map(tool: &str, arguments: &Value) -> Result<Map<String, Value>, ToolError> {
    let invalid = |reason: String| ToolError::InvalidArguments {
        tool: tool.to_string(),
        reason,
    };
    match arguments {
        Value::Object(map) => Ok(map.clone()),
        Value::Null => Ok(Map::new()),
        Value::String(raw) if raw.trim().is_empty() => Ok(Map::new()),
        Value::String(raw) => match serde_json::from_str(raw) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(invalid(format!("expected an object, got {other}"))),
            Err(e) => Err(invalid(e.to_string())),
        },
        other => Err(invalid(format!("expected an object, got {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp::ToolErrorKind;
    use mcp::fake::{FakeProvider, FakeReply};
    use serde_json::json;
    use std::time::Duration;

    async fn session(name: &str, provider: FakeProvider) -> ToolSession {
        provider.connect(name, SessionOptions::default()).await.unwrap()
    }

    #[tokio::test]
    async fn first_registered_provider_wins() {
        let mut registry = ToolRegistry::new();
        let a = session("alpha", FakeProvider::new().tool("read_file", "alpha reader", |_| FakeReply::text("from alpha"))).await;
        let b = session(
            "beta",
            FakeProvider::new()
                .tool("read_file", "beta reader", |_| FakeReply::text("from beta"))
                .tool("write_file", "beta writer", |_| FakeReply::text("written")),
        )
        .await;

        let first = registry.register(a);
        let second = registry.register(b);
        assert_eq!(first.registered, ["read_file"]);
        assert_eq!(second.registered, ["write_file"]);
        assert_eq!(
            second.shadowed,
            [Shadowed {
                name: "read_file".into(),
                kept: "alpha".into(),
                dropped: "beta".into(),
            }]
        );

        for _ in 0..3 {
            assert_eq!(registry.resolve("read_file").unwrap().name(), "alpha");
            let out = registry.dispatch("read_file", &json!({})).await.unwrap();
            assert_eq!(out.render(), "from alpha");
        }

        let names: Vec<_> = registry.catalog().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["read_file", "write_file"]);
        assert_eq!(registry.catalog()[0].description, "alpha reader");
        assert_eq!(registry.shadowed().len(), 1);

        let owners: Vec<_> = registry.entries().map(|e| (e.descriptor.name.as_str(), e.server)).collect();
        assert_eq!(owners, [("read_file", "alpha"), ("write_file", "beta")]);
    }

    #[tokio::test]
    async fn unknown_tool_touches_no_session() {
        let provider = FakeProvider::new().tool("echo", "echo", |_| FakeReply::text("hi"));
        let handle = provider.handle();
        let mut registry = ToolRegistry::new();
        registry.register(session("only", provider).await);
        let before = handle.messages();

        let err = registry.dispatch("missing", &json!({})).await.unwrap_err();
        assert_eq!(err, ToolError::UnknownTool("missing".into()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.messages(), before);
        assert_eq!(handle.calls(), 0);
    }

    #[tokio::test]
    async fn string_arguments_are_parsed() {
        let mut registry = ToolRegistry::new();
        registry.register(
            session(
                "fs",
                FakeProvider::new().tool("list_directory", "ls", |args| FakeReply::text(args["path"].as_str().unwrap_or("?"))),
            )
            .await,
        );

        let out = registry.dispatch("list_directory", &json!("{\"path\": \"/tmp\"}")).await.unwrap();
        assert_eq!(out.render(), "/tmp");

        let err = registry.dispatch("list_directory", &json!([1, 2])).await.unwrap_err();
        assert_eq!(err.kind(), ToolErrorKind::InvalidArguments);
    }

    #[test]
    fn argument_map_shapes() {
        assert!(argument_map("t", &Value::Null).unwrap().is_empty());
        assert!(argument_map("t", &json!("  ")).unwrap().is_empty());
        assert_eq!(argument_map("t", &json!({"a": 1})).unwrap()["a"], 1);
        assert!(argument_map("t", &json!("[1]")).is_err());
        assert!(argument_map("t", &json!("not json")).is_err());
        assert!(argument_map("t", &json!(3)).is_err());
    }

    #[tokio::test]
    async fn failed_providers_are_reported() {
        let configs = vec![ServerConfig {
            name: "ghost".into(),
            command: "/nonexistent/conduit-test-provider".into(),
            ..ServerConfig::default()
        }];
        let (registry, report) = ToolRegistry::connect_all(&configs, SessionOptions::default()).await;
        assert!(registry.is_empty());
        assert!(report.registrations.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].server(), "ghost");
    }

    #[tokio::test]
    async fn shutdown_closes_every_session() {
        let mut registry = ToolRegistry::new();
        registry.register(session("a", FakeProvider::new().tool("x", "", |_| FakeReply::text("x"))).await);
        registry.register(session("b", FakeProvider::new().tool("y", "", |_| FakeReply::text("y"))).await);

        registry.shutdown().await;
        registry.shutdown().await;
        for session in registry.sessions() {
            assert_eq!(session.state(), mcp::ConnectionState::Closed);
        }
        let err = registry.dispatch("x", &json!({})).await.unwrap_err();
        assert_eq!(err.kind(), ToolErrorKind::Disconnected);
    }
}
