//! Anthropic Messages API backend.

use std::time::Duration;

use mcp::ToolDescriptor;
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    BackendAdapter, DEFAULT_BACKEND_TIMEOUT, ProbeReport, endpoint, execute, fetch_models, read_json,
    with_deadline,
};
use crate::conversation::Conversation;
use crate::model::{BackendError, DecodedReply, Message, Part, Role, ToolCallRequest};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Authentication mode for Anthropic API.
#[derive(Debug, Clone)]
pub enum AnthropicAuth {
    /// Standard API key authentication.
    ApiKey(String),
    /// OAuth bearer token.
    Bearer(String),
}

impl std::fmt::Display for AnthropicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey(_) => write!(f, "api_key"),
            Self::Bearer(_) => write!(f, "bearer"),
        }
    }
}

impl AnthropicAuth {
    fn apply_headers(&self, req: RequestBuilder) -> RequestBuilder {
        match self {
            Self::ApiKey(key) => req.header("x-api-key", key),
            Self::Bearer(token) => req.header("Authorization", format!("Bearer {token}")),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// API Wire Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ApiRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool>,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: ApiContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ApiContent {
    Text(String),
    Blocks(Vec<ApiContentBlock>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Debug, Serialize)]
struct ApiTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
pub struct ApiResponse {
    content: Vec<ApiResponseBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct ApiModelList {
    data: Vec<ApiModel>,
}

#[derive(Debug, Deserialize)]
struct ApiModel {
    id: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend Implementation
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for creating an Anthropic backend.
#[derive(Debug, Clone)]
pub struct AnthropicBackendBuilder {
    auth: AnthropicAuth,
    model: String,
    max_tokens: u32,
    base_url: String,
    timeout: Duration,
}

impl AnthropicBackendBuilder {
    pub fn new(auth: AnthropicAuth, model: impl Into<String>) -> Self {
        Self {
            auth,
            model: model.into(),
            max_tokens: 4096,
            base_url: ANTHROPIC_BASE_URL.to_string(),
            timeout: DEFAULT_BACKEND_TIMEOUT,
        }
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> AnthropicBackend {
        AnthropicBackend {
            client: reqwest::Client::new(),
            auth: self.auth,
            model: self.model,
            max_tokens: self.max_tokens,
            base_url: self.base_url,
            timeout: self.timeout,
        }
    }
}

/// Anthropic API backend.
pub struct AnthropicBackend {
    client: reqwest::Client,
    auth: AnthropicAuth,
    model: String,
    max_tokens: u32,
    base_url: String,
    timeout: Duration,
}

impl AnthropicBackend {
    pub fn builder(auth: AnthropicAuth, model: impl Into<String>) -> AnthropicBackendBuilder {
        AnthropicBackendBuilder::new(auth, model)
    }

    fn request(&self, req: RequestBuilder) -> RequestBuilder {
        self.auth
            .apply_headers(req)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("accept", "application/json")
    }

    fn message_to_api(msg: &Message) -> ApiMessage {
        let role = match msg.role {
            Role::Assistant => "assistant",
            // Tool results travel in user turns.
            Role::User | Role::ToolResult | Role::System => "user",
        };

        // Simple case: single text part
        if let [Part::Text(text)] = msg.parts.as_slice() {
            return ApiMessage {
                role,
                content: ApiContent::Text(text.clone()),
            };
        }

        let blocks = msg
            .parts
            .iter()
            .map(|part| match part {
                Part::Text(text) => ApiContentBlock::Text { text: text.clone() },
                Part::ToolCall(call) => ApiContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.tool_name.clone(),
                    input: object_or_empty(&call.arguments),
                },
                Part::ToolResult(result) => ApiContentBlock::ToolResult {
                    tool_use_id: result.tool_call_id().to_string(),
                    content: result.content(),
                    is_error: result.is_error(),
                },
            })
            .collect();

        ApiMessage {
            role,
            content: ApiContent::Blocks(blocks),
        }
    }

    fn tool_to_api(descriptor: &ToolDescriptor) -> ApiTool {
        ApiTool {
            name: descriptor.name.clone(),
            description: descriptor.description.clone(),
            input_schema: descriptor.parameter_schema.clone(),
        }
    }
}

/// `tool_use.input` must be an object.
fn object_or_empty(arguments: &Value) -> Value {
    match arguments {
        Value::Object(_) => arguments.clone(),
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(parsed @ Value::Object(_)) => parsed,
            _ => Value::Object(Default::default()),
        },
        _ => Value::Object(Default::default()),
    }
}

impl std::fmt::Display for AnthropicBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "anthropic({}, auth={})", self.model, self.auth)
    }
}

impl BackendAdapter for AnthropicBackend {
    type Request = ApiRequest;
    type Response = ApiResponse;

    fn describe(&self) -> String {
        self.to_string()
    }

    fn encode_request(&self, conversation: &Conversation, catalog: &[ToolDescriptor]) -> ApiRequest {
        let mut messages: Vec<ApiMessage> = Vec::new();
        for msg in conversation.dialogue() {
            // The Messages API rejects empty content.
            if msg.parts.iter().all(|part| matches!(part, Part::Text(text) if text.trim().is_empty())) {
                continue;
            }
            let api = Self::message_to_api(msg);
            // Results of one round share a single user turn.
            let merges = msg.role == Role::ToolResult
                && matches!(
                    messages.last(),
                    Some(ApiMessage {
                        role: "user",
                        content: ApiContent::Blocks(_),
                    })
                );
            if merges {
                if let (ApiContent::Blocks(more), Some(last)) = (api.content, messages.last_mut()) {
                    if let ApiContent::Blocks(blocks) = &mut last.content {
                        blocks.extend(more);
                    }
                }
                continue;
            }
            messages.push(api);
        }

        ApiRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            messages,
            system: conversation.system_prompt(),
            tools: catalog.iter().map(Self::tool_to_api).collect(),
        }
    }

    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, BackendError> {
        let url = endpoint(&self.base_url, "v1/messages");
        with_deadline(self.timeout, async {
            let req = self.request(self.client.post(&url)).json(&request);
            let response = execute(req, &url).await?;
            read_json(response).await
        })
        .await
    }

    fn decode_response(&self, response: ApiResponse) -> Result<DecodedReply, BackendError> {
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in response.content {
            match block {
                ApiResponseBlock::Text { text: chunk } => text.push_str(&chunk),
                ApiResponseBlock::ToolUse { id, name, input } => {
                    tool_calls.push(ToolCallRequest::new(id, name, input));
                }
                ApiResponseBlock::Unknown => {}
            }
        }

        Ok(DecodedReply {
            text: (!text.is_empty()).then_some(text),
            tool_calls,
        })
    }

    async fn probe(&self) -> Result<ProbeReport, BackendError> {
        let url = endpoint(&self.base_url, "v1/models");
        let listing: ApiModelList = fetch_models(self.request(self.client.get(&url)), &url).await?;
        Ok(ProbeReport {
            endpoint: url,
            model: self.model.clone(),
            models: listing.data.into_iter().map(|m| m.id).collect(),
        })
    }
}
