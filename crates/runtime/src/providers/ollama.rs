//! Ollama local model backend (`/api/chat`).

use std::time::Duration;

use futures::TryStreamExt;
use mcp::ToolDescriptor;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use super::{
    BackendAdapter, DEFAULT_BACKEND_TIMEOUT, ProbeReport, endpoint, execute, fetch_models, read_json,
    with_deadline,
};
use crate::conversation::Conversation;
use crate::model::{BackendError, DecodedReply, Message, Part, Role, ToolCallRequest, synthetic_call_id};

pub const DEFAULT_OLLAMA_PORT: u16 = 11434;

/// Longest NDJSON chunk accepted from a streamed reply (1MB).
const MAX_CHUNK_SIZE: usize = 1024 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// API Wire Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ChatTool>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    function: WireFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Serialize)]
struct ChatTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: ChatFunction,
}

#[derive(Debug, Serialize)]
struct ChatFunction {
    name: String,
    description: String,
    parameters: Value,
}

/// A complete reply, or one chunk of a streamed one.
#[derive(Debug, Default, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    message: ReplyMessage,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    models: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
struct Tag {
    name: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend Implementation
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for creating an Ollama backend.
#[derive(Debug, Clone)]
pub struct OllamaBackendBuilder {
    model: String,
    base_url: String,
    stream: bool,
    timeout: Duration,
}

impl OllamaBackendBuilder {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            base_url: format!("http://localhost:{DEFAULT_OLLAMA_PORT}"),
            stream: false,
            timeout: DEFAULT_BACKEND_TIMEOUT,
        }
    }

    pub fn host(mut self, host: &str, port: u16) -> Self {
        self.base_url = format!("http://{host}:{port}");
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Ask for NDJSON chunks instead of one body.
    pub fn stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> OllamaBackend {
        OllamaBackend {
            client: reqwest::Client::new(),
            model: self.model,
            base_url: self.base_url,
            stream: self.stream,
            timeout: self.timeout,
        }
    }
}

/// Ollama backend.
pub struct OllamaBackend {
    client: reqwest::Client,
    model: String,
    base_url: String,
    stream: bool,
    timeout: Duration,
}

impl OllamaBackend {
    pub fn builder(model: impl Into<String>) -> OllamaBackendBuilder {
        OllamaBackendBuilder::new(model)
    }

    fn message_to_api(msg: &Message) -> ChatMessage {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::ToolResult => "tool",
        };

        let mut out = ChatMessage {
            role,
            content: msg.text(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        };
        for part in &msg.parts {
            match part {
                Part::Text(_) => {}
                Part::ToolCall(call) => out.tool_calls.push(WireToolCall {
                    id: Some(call.id.clone()),
                    function: WireFunction {
                        name: call.tool_name.clone(),
                        arguments: call.arguments.clone(),
                    },
                }),
                Part::ToolResult(result) => {
                    out.content = result.content();
                    out.tool_call_id = Some(result.tool_call_id().to_string());
                }
            }
        }
        out
    }

    fn tool_to_api(descriptor: &ToolDescriptor) -> ChatTool {
        ChatTool {
            tool_type: "function",
            function: ChatFunction {
                name: descriptor.name.clone(),
                description: descriptor.description.clone(),
                parameters: descriptor.parameter_schema.clone(),
            },
        }
    }

    /// Fold NDJSON chunks into one reply, stopping at `done`.
    async fn read_stream(response: reqwest::Response) -> Result<ChatResponse, BackendError> {
        let body = StreamReader::new(Box::pin(response.bytes_stream().map_err(std::io::Error::other)));
        let mut lines = FramedRead::new(body, LinesCodec::new_with_max_length(MAX_CHUNK_SIZE));
        let mut merged = ChatResponse::default();

        while let Some(line) = lines.try_next().await.map_err(|e| match e {
            LinesCodecError::MaxLineLengthExceeded => {
                BackendError::InvalidResponse(format!("stream chunk exceeds {MAX_CHUNK_SIZE} bytes"))
            }
            LinesCodecError::Io(e) => BackendError::Network(e.to_string()),
        })? {
            if line.trim().is_empty() {
                continue;
            }
            let chunk: ChatResponse = match serde_json::from_str(&line) {
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!(error = %e, "skipping undecodable stream chunk");
                    continue;
                }
            };
            merged.message.content.push_str(&chunk.message.content);
            merged.message.tool_calls.extend(chunk.message.tool_calls);
            if chunk.done {
                merged.done = true;
                return Ok(merged);
            }
        }

        warn!("ollama stream ended without a final chunk");
        Ok(merged)
    }
}

impl std::fmt::Display for OllamaBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ollama({}, {})", self.model, self.base_url)
    }
}

impl BackendAdapter for OllamaBackend {
    type Request = ChatRequest;
    type Response = ChatResponse;

    fn describe(&self) -> String {
        self.to_string()
    }

    fn encode_request(&self, conversation: &Conversation, catalog: &[ToolDescriptor]) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: conversation.messages().iter().map(Self::message_to_api).collect(),
            stream: self.stream,
            tools: catalog.iter().map(Self::tool_to_api).collect(),
        }
    }

    async fn send(&self, request: ChatRequest) -> Result<ChatResponse, BackendError> {
        let url = endpoint(&self.base_url, "api/chat");
        with_deadline(self.timeout, async {
            let response = execute(self.client.post(&url).json(&request), &url).await?;
            if request.stream {
                Self::read_stream(response).await
            } else {
                read_json(response).await
            }
        })
        .await
    }

    fn decode_response(&self, response: ChatResponse) -> Result<DecodedReply, BackendError> {
        let ReplyMessage { content, tool_calls } = response.message;
        let tool_calls = tool_calls
            .into_iter()
            .map(|call| {
                let id = call
                    .id
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(synthetic_call_id);
                ToolCallRequest::new(id, call.function.name, call.function.arguments)
            })
            .collect();

        Ok(DecodedReply {
            text: (!content.is_empty()).then_some(content),
            tool_calls,
        })
    }

    async fn probe(&self) -> Result<ProbeReport, BackendError> {
        let url = endpoint(&self.base_url, "api/tags");
        let tags: TagList = fetch_models(self.client.get(&url), &url).await?;
        Ok(ProbeReport {
            endpoint: self.base_url.clone(),
            model: self.model.clone(),
            models: tags.models.into_iter().map(|t| t.name).collect(),
        })
    }
}
