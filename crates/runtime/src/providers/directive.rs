//! Agent-style backend over a text-only chat completions endpoint.
//!
//! The model never sees a native tool schema. Tools are described in a
//! system instruction and the model answers with JSON directives:
//!
//! ```text
//! {"action":"call_tool","tool":"list_directory","input":{"path":"."}}
//! {"action":"final","response":"There are two files."}
//! ```
//!
//! Replies that carry no directive are taken as the final answer.

use std::time::Duration;

use mcp::ToolDescriptor;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::debug;

use super::{
    BackendAdapter, DEFAULT_BACKEND_TIMEOUT, ProbeReport, endpoint, execute, fetch_models, read_json,
    with_deadline,
};
use crate::conversation::Conversation;
use crate::model::{BackendError, DecodedReply, Message, Role, ToolCallRequest, ToolResult, synthetic_call_id};

const OPENAI_BASE_URL: &str = "https://api.openai.com";

// ─────────────────────────────────────────────────────────────────────────────
// API Wire Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct CompletionRequest {
    model: String,
    messages: Vec<CompletionMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct CompletionMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Directive protocol
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Directive {
    CallTool { tool: String, input: Value },
    Final { response: String },
}

impl Directive {
    fn to_json(&self) -> Value {
        match self {
            Self::CallTool { tool, input } => json!({"action": "call_tool", "tool": tool, "input": input}),
            Self::Final { response } => json!({"action": "final", "response": response}),
        }
    }
}

fn compose_instructions(system: Option<String>, catalog: &[ToolDescriptor]) -> String {
    let mut lines: Vec<String> = system.into_iter().collect();
    lines.push(
        "You are an assistant that can call tools to solve user requests. \
         Every reply must be a single JSON object without commentary or code fences."
            .to_string(),
    );
    lines.push(
        "To invoke a tool, reply with: {\"action\":\"call_tool\",\"tool\":\"tool_name\",\"input\":{...}}. \
         The result arrives in the next user message as {\"action\":\"tool_result\",...}."
            .to_string(),
    );
    lines.push(
        "When you are ready to answer the user, reply with: {\"action\":\"final\",\"response\":\"...\"}."
            .to_string(),
    );

    if catalog.is_empty() {
        lines.push("No tools are available.".to_string());
        return lines.join("\n");
    }

    lines.push("Available tools:".to_string());
    for descriptor in catalog {
        let mut line = format!("- {}", descriptor.name);
        if !descriptor.description.is_empty() {
            line.push_str(&format!(": {}", descriptor.description));
        }
        line.push_str(&format!(". Input schema: {}", descriptor.parameter_schema));
        lines.push(line);
    }
    lines.join("\n")
}

fn message_to_api(msg: &Message) -> Option<CompletionMessage> {
    match msg.role {
        Role::System => None,
        Role::User => Some(CompletionMessage {
            role: "user",
            content: msg.text(),
        }),
        Role::Assistant => {
            let calls: Vec<Value> = msg
                .tool_calls()
                .map(|call| {
                    Directive::CallTool {
                        tool: call.tool_name.clone(),
                        input: call.arguments.clone(),
                    }
                    .to_json()
                })
                .collect();
            let content = match calls.len() {
                0 => Directive::Final { response: msg.text() }.to_json(),
                1 => calls.into_iter().next().unwrap_or_default(),
                _ => Value::Array(calls),
            };
            Some(CompletionMessage {
                role: "assistant",
                content: content.to_string(),
            })
        }
        Role::ToolResult => {
            let result = msg.result()?;
            let mut payload = json!({"action": "tool_result", "tool_call_id": result.tool_call_id()});
            match result {
                ToolResult::Success { output, .. } => payload["output"] = json!(output),
                ToolResult::Failure { error, .. } => payload["error"] = json!(error.to_string()),
            }
            Some(CompletionMessage {
                role: "user",
                content: payload.to_string(),
            })
        }
    }
}

/// Pull a JSON value out of a model reply, tolerating code fences and
/// surrounding prose.
fn extract_json(content: &str) -> Option<Value> {
    let trimmed = content.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    if trimmed.starts_with("```") {
        let stripped = trimmed
            .trim_start_matches("```json")
            .trim_start_matches("```JSON")
            .trim_start_matches("```");
        if let Some(end) = stripped.rfind("```") {
            if let Ok(value) = serde_json::from_str::<Value>(stripped[..end].trim()) {
                return Some(value);
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                return Some(value);
            }
        }
    }

    None
}

fn parse_directive(map: &Map<String, Value>) -> Result<Directive, BackendError> {
    let action = map
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| BackendError::InvalidResponse("directive missing action field".into()))?;

    match action {
        "call_tool" => {
            let tool = map
                .get("tool")
                .and_then(Value::as_str)
                .ok_or_else(|| BackendError::InvalidResponse("call_tool directive missing tool field".into()))?;
            Ok(Directive::CallTool {
                tool: tool.to_string(),
                input: map.get("input").cloned().unwrap_or(Value::Null),
            })
        }
        "final" => {
            let response = match map.get("response") {
                Some(Value::String(text)) => text.clone(),
                Some(other) => other.to_string(),
                None => {
                    return Err(BackendError::InvalidResponse(
                        "final directive missing response field".into(),
                    ));
                }
            };
            Ok(Directive::Final { response })
        }
        other => Err(BackendError::InvalidResponse(format!("unknown action value: {other}"))),
    }
}

/// Decode a reply into calls or a final answer.
fn parse_reply(content: &str) -> Result<DecodedReply, BackendError> {
    let directives = match extract_json(content) {
        Some(Value::Object(map)) if map.contains_key("action") => vec![parse_directive(&map)?],
        Some(Value::Array(items)) if !items.is_empty() && items.iter().all(|i| i.get("action").is_some()) => items
            .iter()
            .filter_map(Value::as_object)
            .map(parse_directive)
            .collect::<Result<_, _>>()?,
        _ => {
            debug!("reply carries no directive; treating it as the final answer");
            let text = content.trim();
            return Ok(DecodedReply {
                text: (!text.is_empty()).then(|| text.to_string()),
                tool_calls: Vec::new(),
            });
        }
    };

    let mut reply = DecodedReply::default();
    for directive in directives {
        match directive {
            Directive::CallTool { tool, input } => {
                reply.tool_calls.push(ToolCallRequest::new(synthetic_call_id(), tool, input));
            }
            Directive::Final { response } => {
                reply.text.get_or_insert_with(String::new).push_str(&response);
            }
        }
    }
    Ok(reply)
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend Implementation
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for creating a directive backend.
#[derive(Debug, Clone)]
pub struct DirectiveBackendBuilder {
    model: String,
    base_url: String,
    api_key: Option<String>,
    temperature: Option<f32>,
    timeout: Duration,
}

impl DirectiveBackendBuilder {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            base_url: OPENAI_BASE_URL.to_string(),
            api_key: None,
            temperature: Some(0.0),
            timeout: DEFAULT_BACKEND_TIMEOUT,
        }
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> DirectiveBackend {
        DirectiveBackend {
            client: reqwest::Client::new(),
            model: self.model,
            base_url: self.base_url,
            api_key: self.api_key,
            temperature: self.temperature,
            timeout: self.timeout,
        }
    }
}

/// Directive backend.
pub struct DirectiveBackend {
    client: reqwest::Client,
    model: String,
    base_url: String,
    api_key: Option<String>,
    temperature: Option<f32>,
    timeout: Duration,
}

impl DirectiveBackend {
    pub fn builder(model: impl Into<String>) -> DirectiveBackendBuilder {
        DirectiveBackendBuilder::new(model)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}

impl std::fmt::Display for DirectiveBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "directive({}, {})", self.model, self.base_url)
    }
}

impl BackendAdapter for DirectiveBackend {
    type Request = CompletionRequest;
    type Response = CompletionResponse;

    fn describe(&self) -> String {
        self.to_string()
    }

    fn encode_request(&self, conversation: &Conversation, catalog: &[ToolDescriptor]) -> CompletionRequest {
        let mut messages = vec![CompletionMessage {
            role: "system",
            content: compose_instructions(conversation.system_prompt(), catalog),
        }];
        messages.extend(conversation.dialogue().filter_map(message_to_api));

        CompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
        }
    }

    async fn send(&self, request: CompletionRequest) -> Result<CompletionResponse, BackendError> {
        let url = endpoint(&self.base_url, "v1/chat/completions");
        with_deadline(self.timeout, async {
            let req = self.authorize(self.client.post(&url)).json(&request);
            let response = execute(req, &url).await?;
            read_json(response).await
        })
        .await
    }

    fn decode_response(&self, response: CompletionResponse) -> Result<DecodedReply, BackendError> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::InvalidResponse("completion has no choices".into()))?;
        parse_reply(choice.message.content.as_deref().unwrap_or_default())
    }

    async fn probe(&self) -> Result<ProbeReport, BackendError> {
        let url = endpoint(&self.base_url, "v1/models");
        let listing: ModelList = fetch_models(self.authorize(self.client.get(&url)), &url).await?;
        Ok(ProbeReport {
            endpoint: url,
            model: self.model.clone(),
            models: listing.data.into_iter().map(|m| m.id).collect(),
        })
    }
}
