//! In-memory tool provider for tests.
//!
//! Speaks just enough MCP over a `tokio::io::duplex` pipe to exercise
//! sessions without spawning processes.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::session::{SessionOptions, ToolSession};

/// What a fake tool does when called.
#[derive(Debug, Clone)]
pub enum FakeReply {
    /// Successful text content.
    Text(String),
    /// Result flagged `isError` with the given text.
    Error(String),
    /// JSON-RPC error reply.
    Rpc(i64, String),
    /// Text content, sent after a delay.
    Delay(Duration, String),
    /// Close the connection without replying.
    Exit,
}

impl FakeReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }
}

type Handler = Arc<dyn Fn(&Value) -> FakeReply + Send + Sync>;

struct FakeTool {
    name: String,
    description: String,
    handler: Handler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Normal,
    MalformedListing,
    Silent,
}

#[derive(Default)]
struct Stats {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    messages: AtomicUsize,
}

/// Observes traffic that reached a fake provider.
#[derive(Clone)]
pub struct FakeHandle {
    stats: Arc<Stats>,
}

impl FakeHandle {
    /// Number of `tools/call` requests received.
    pub fn calls(&self) -> usize {
        self.stats.calls.load(Ordering::SeqCst)
    }

    /// Highest number of tool calls being handled at once.
    pub fn max_in_flight(&self) -> usize {
        self.stats.max_in_flight.load(Ordering::SeqCst)
    }

    /// Number of JSON-RPC messages of any kind received.
    pub fn messages(&self) -> usize {
        self.stats.messages.load(Ordering::SeqCst)
    }
}

/// Scripted MCP server.
pub struct FakeProvider {
    tools: Vec<FakeTool>,
    mode: Mode,
    stats: Arc<Stats>,
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            mode: Mode::Normal,
            stats: Arc::default(),
        }
    }

    /// Add a tool with a handler over its JSON arguments.
    pub fn tool(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        handler: impl Fn(&Value) -> FakeReply + Send + Sync + 'static,
    ) -> Self {
        self.tools.push(FakeTool {
            name: name.into(),
            description: description.into(),
            handler: Arc::new(handler),
        });
        self
    }

    /// Answer `tools/list` with a body that is not a tool listing.
    pub fn malformed_listing(mut self) -> Self {
        self.mode = Mode::MalformedListing;
        self
    }

    /// Never answer anything.
    pub fn silent(mut self) -> Self {
        self.mode = Mode::Silent;
        self
    }

    pub fn handle(&self) -> FakeHandle {
        FakeHandle {
            stats: Arc::clone(&self.stats),
        }
    }

    /// Start serving; returns the client's read and write halves.
    pub fn serve(self) -> (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(self.run(server));
        tokio::io::split(client)
    }

    /// Start serving and connect a session to it.
    pub async fn connect(self, name: &str, options: SessionOptions) -> Result<ToolSession> {
        let (reader, writer) = self.serve();
        ToolSession::over_stream(name, reader, writer, options).await
    }

    async fn run(self, stream: DuplexStream) {
        let (read, write) = tokio::io::split(stream);
        let writer = Arc::new(Mutex::new(write));
        let tools = Arc::new(self.tools);
        let mut lines = BufReader::new(read).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            self.stats.messages.fetch_add(1, Ordering::SeqCst);
            if self.mode == Mode::Silent {
                continue;
            }
            let Ok(message) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            let id = message["id"].clone();
            let method = message["method"].as_str().unwrap_or_default();

            match method {
                "initialize" => {
                    let result = json!({
                        "protocolVersion": crate::PROTOCOL_VERSION,
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": "fake", "version": "0.0.0"}
                    });
                    reply(&writer, json!({"jsonrpc": "2.0", "id": id, "result": result})).await;
                }
                "tools/list" => {
                    let result = if self.mode == Mode::MalformedListing {
                        json!({"tools": "not a list"})
                    } else {
                        let listed: Vec<Value> = tools
                            .iter()
                            .map(|t| {
                                json!({
                                    "name": t.name,
                                    "description": t.description,
                                    "inputSchema": {"type": "object", "properties": {}}
                                })
                            })
                            .collect();
                        json!({"tools": listed})
                    };
                    reply(&writer, json!({"jsonrpc": "2.0", "id": id, "result": result})).await;
                }
                "tools/call" => {
                    self.stats.calls.fetch_add(1, Ordering::SeqCst);
                    let name = message["params"]["name"].as_str().unwrap_or_default();
                    let arguments = message["params"]["arguments"].clone();
                    let outcome = tools
                        .iter()
                        .find(|t| t.name == name)
                        .map(|t| (t.handler)(&arguments))
                        .unwrap_or_else(|| FakeReply::Rpc(-32602, format!("unknown tool: {name}")));

                    if matches!(outcome, FakeReply::Exit) {
                        break;
                    }

                    let writer = Arc::clone(&writer);
                    let stats = Arc::clone(&self.stats);
                    tokio::spawn(async move {
                        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        stats.max_in_flight.fetch_max(now, Ordering::SeqCst);
                        let body = match outcome {
                            FakeReply::Text(text) => json!({"jsonrpc": "2.0", "id": id, "result": {
                                "content": [{"type": "text", "text": text}]
                            }}),
                            FakeReply::Error(text) => json!({"jsonrpc": "2.0", "id": id, "result": {
                                "content": [{"type": "text", "text": text}],
                                "isError": true
                            }}),
                            FakeReply::Rpc(code, message) => json!({"jsonrpc": "2.0", "id": id,
                                "error": {"code": code, "message": message}
                            }),
                            FakeReply::Delay(delay, text) => {
                                tokio::time::sleep(delay).await;
                                json!({"jsonrpc": "2.0", "id": id, "result": {
                                    "content": [{"type": "text", "text": text}]
                                }})
                            }
                            FakeReply::Exit => unreachable!("handled before spawning"),
                        };
                        stats.in_flight.fetch_sub(1, Ordering::SeqCst);
                        reply(&writer, body).await;
                    });
                }
                _ => {}
            }
        }
    }
}

async fn reply(writer: &Mutex<WriteHalf<DuplexStream>>, body: Value) {
    let mut line = body.to_string();
    line.push('\n');
    let mut writer = writer.lock().await;
    let _ = writer.write_all(line.as_bytes()).await;
}
