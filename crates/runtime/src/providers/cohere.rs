//! Cohere chat backend (v1 `/chat` with tool use).

use std::collections::HashMap;
use std::time::Duration;

use mcp::ToolDescriptor;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::{
    BackendAdapter, DEFAULT_BACKEND_TIMEOUT, ProbeReport, endpoint, execute, fetch_models, read_json,
    with_deadline,
};
use crate::conversation::Conversation;
use crate::model::{BackendError, DecodedReply, Message, Role, ToolCallRequest, ToolResult, synthetic_call_id};

const COHERE_BASE_URL: &str = "https://api.cohere.com";

// ─────────────────────────────────────────────────────────────────────────────
// API Wire Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ChatRequest {
    model: String,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    chat_history: Vec<HistoryEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    preamble: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_results: Vec<ApiToolResult>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
#[serde(tag = "role", rename_all = "UPPERCASE")]
enum HistoryEntry {
    User {
        message: String,
    },
    Chatbot {
        message: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ApiCall>,
    },
    Tool {
        tool_results: Vec<ApiToolResult>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiCall {
    name: String,
    #[serde(default)]
    parameters: Value,
}

#[derive(Debug, Serialize)]
struct ApiToolResult {
    call: ApiCall,
    outputs: Vec<Value>,
}

#[derive(Debug, Serialize)]
struct ApiTool {
    name: String,
    description: String,
    parameter_definitions: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    tool_calls: Option<Vec<ApiCall>>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    name: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend Implementation
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for creating a Cohere backend.
#[derive(Debug, Clone)]
pub struct CohereBackendBuilder {
    api_key: String,
    model: String,
    base_url: String,
    temperature: f32,
    timeout: Duration,
}

impl CohereBackendBuilder {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: COHERE_BASE_URL.to_string(),
            temperature: 0.3,
            timeout: DEFAULT_BACKEND_TIMEOUT,
        }
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> CohereBackend {
        CohereBackend {
            client: reqwest::Client::new(),
            api_key: self.api_key,
            model: self.model,
            base_url: self.base_url,
            temperature: self.temperature,
            timeout: self.timeout,
        }
    }
}

/// Cohere backend.
///
/// The v1 API takes the newest user message (or the newest tool results)
/// separately from the history, and identifies calls by name and
/// parameters only, so call ids are generated locally.
pub struct CohereBackend {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    temperature: f32,
    timeout: Duration,
}

impl CohereBackend {
    pub fn builder(api_key: impl Into<String>, model: impl Into<String>) -> CohereBackendBuilder {
        CohereBackendBuilder::new(api_key, model)
    }

    fn tool_to_api(descriptor: &ToolDescriptor) -> ApiTool {
        ApiTool {
            name: descriptor.name.clone(),
            description: descriptor.description.clone(),
            parameter_definitions: parameter_definitions(&descriptor.parameter_schema),
        }
    }
}

/// Flatten a JSON schema's top-level properties into Cohere parameter
/// definitions.
fn parameter_definitions(schema: &Value) -> Map<String, Value> {
    let required: Vec<&str> = schema["required"]
        .as_array()
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let Some(properties) = schema["properties"].as_object() else {
        return Map::new();
    };

    properties
        .iter()
        .map(|(name, property)| {
            let kind = match property["type"].as_str() {
                Some("string") => "str",
                Some("integer") => "int",
                Some("number") => "float",
                Some("boolean") => "bool",
                Some("array") => "list",
                Some("object") => "dict",
                _ => "str",
            };
            let definition = json!({
                "description": property["description"].as_str().unwrap_or_default(),
                "type": kind,
                "required": required.contains(&name.as_str()),
            });
            (name.clone(), definition)
        })
        .collect()
}

fn call_to_api(call: &ToolCallRequest) -> ApiCall {
    ApiCall {
        name: call.tool_name.clone(),
        parameters: call.arguments.clone(),
    }
}

fn result_to_api(result: &ToolResult, calls: &HashMap<&str, &ToolCallRequest>) -> ApiToolResult {
    let call = calls.get(result.tool_call_id()).map_or_else(
        || ApiCall {
            name: String::new(),
            parameters: Value::Object(Map::new()),
        },
        |call| call_to_api(call),
    );
    let output = match result {
        ToolResult::Success { output, .. } => json!({ "result": output }),
        ToolResult::Failure { error, .. } => json!({ "error": error.to_string() }),
    };
    ApiToolResult {
        call,
        outputs: vec![output],
    }
}

impl std::fmt::Display for CohereBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cohere({})", self.model)
    }
}

impl BackendAdapter for CohereBackend {
    type Request = ChatRequest;
    type Response = ChatResponse;

    fn describe(&self) -> String {
        self.to_string()
    }

    fn encode_request(&self, conversation: &Conversation, catalog: &[ToolDescriptor]) -> ChatRequest {
        let dialogue: Vec<&Message> = conversation.dialogue().collect();
        let calls: HashMap<&str, &ToolCallRequest> = dialogue
            .iter()
            .copied()
            .flat_map(Message::tool_calls)
            .map(|call| (call.id.as_str(), call))
            .collect();

        // Trailing tool results go in `tool_results`; a trailing user
        // message goes in `message`; everything before is history.
        let pending = dialogue
            .iter()
            .rev()
            .take_while(|m| m.role == Role::ToolResult)
            .count();
        let (history, message, tool_results) = if pending > 0 {
            let split = dialogue.len() - pending;
            let results: Vec<ApiToolResult> = dialogue[split..]
                .iter()
                .filter_map(|m| m.result())
                .map(|r| result_to_api(r, &calls))
                .collect();
            (&dialogue[..split], String::new(), results)
        } else {
            match dialogue.split_last() {
                Some((last, rest)) if last.role == Role::User => (rest, last.text(), Vec::new()),
                _ => (dialogue.as_slice(), String::new(), Vec::new()),
            }
        };

        let mut chat_history: Vec<HistoryEntry> = Vec::new();
        for msg in history {
            match msg.role {
                Role::User => chat_history.push(HistoryEntry::User { message: msg.text() }),
                Role::Assistant => chat_history.push(HistoryEntry::Chatbot {
                    message: msg.text(),
                    tool_calls: msg.tool_calls().map(call_to_api).collect(),
                }),
                Role::ToolResult => {
                    let Some(result) = msg.result() else { continue };
                    let entry = result_to_api(result, &calls);
                    match chat_history.last_mut() {
                        Some(HistoryEntry::Tool { tool_results }) => tool_results.push(entry),
                        _ => chat_history.push(HistoryEntry::Tool {
                            tool_results: vec![entry],
                        }),
                    }
                }
                Role::System => {}
            }
        }

        ChatRequest {
            model: self.model.clone(),
            message,
            chat_history,
            preamble: conversation.system_prompt(),
            tools: catalog.iter().map(Self::tool_to_api).collect(),
            tool_results,
            temperature: self.temperature,
        }
    }

    async fn send(&self, request: ChatRequest) -> Result<ChatResponse, BackendError> {
        let url = endpoint(&self.base_url, "v1/chat");
        with_deadline(self.timeout, async {
            let req = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .header("accept", "application/json")
                .json(&request);
            let response = execute(req, &url).await?;
            read_json(response).await
        })
        .await
    }

    fn decode_response(&self, response: ChatResponse) -> Result<DecodedReply, BackendError> {
        let tool_calls = response
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| ToolCallRequest::new(synthetic_call_id(), call.name, call.parameters))
            .collect();

        Ok(DecodedReply {
            text: (!response.text.is_empty()).then_some(response.text),
            tool_calls,
        })
    }

    async fn probe(&self) -> Result<ProbeReport, BackendError> {
        let url = endpoint(&self.base_url, "v1/models");
        let listing: ModelList = fetch_models(self.client.get(&url).bearer_auth(&self.api_key), &url).await?;
        Ok(ProbeReport {
            endpoint: url,
            model: self.model.clone(),
            models: listing.models.into_iter().map(|m| m.name).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::stub;
    use mcp::ToolError;

    fn backend(base_url: &str) -> CohereBackend {
        CohereBackend::builder("key", "command-r")
            .base_url(base_url)
            .timeout(Duration::from_secs(5))
            .build()
    }

    fn tool() -> ToolDescriptor {
        ToolDescriptor {
            name: "search_papers".into(),
            description: "Search arXiv".into(),
            parameter_schema: json!({
                "type": "object",
                "properties": {
                    "topic": {"type": "string", "description": "Topic to search"},
                    "max_results": {"type": "integer"}
                },
                "required": ["topic"]
            }),
        }
    }

    #[test]
    fn schema_becomes_parameter_definitions() {
        let defs = parameter_definitions(&tool().parameter_schema);
        assert_eq!(
            defs["topic"],
            json!({"description": "Topic to search", "type": "str", "required": true})
        );
        assert_eq!(defs["max_results"]["type"], "int");
        assert_eq!(defs["max_results"]["required"], false);
        assert!(parameter_definitions(&json!({"type": "object"})).is_empty());
    }

    #[test]
    fn newest_user_message_is_split_from_history() {
        let mut conversation = Conversation::with_system("be helpful");
        let mut turn = conversation.begin_turn();
        turn.push(Message::user("hi"));
        turn.push(Message::assistant("hello"));
        turn.push(Message::user("find papers on rust"));
        turn.commit();

        let body = serde_json::to_value(backend("http://unused").encode_request(&conversation, &[tool()])).unwrap();
        assert_eq!(body["message"], "find papers on rust");
        assert_eq!(body["preamble"], "be helpful");
        assert_eq!(
            body["chat_history"],
            json!([
                {"role": "USER", "message": "hi"},
                {"role": "CHATBOT", "message": "hello"}
            ])
        );
        assert_eq!(body["tools"][0]["parameter_definitions"]["topic"]["type"], "str");
        assert!(body.get("tool_results").is_none());
    }

    #[test]
    fn trailing_results_are_submitted_as_tool_results() {
        let mut conversation = Conversation::new();
        let mut turn = conversation.begin_turn();
        turn.push(Message::user("find papers"));
        turn.push(Message::assistant_turn(
            None,
            vec![
                ToolCallRequest::new("c1", "search_papers", json!({"topic": "rust"})),
                ToolCallRequest::new("c2", "missing", json!({})),
            ],
        ));
        turn.push(Message::tool_result(ToolResult::Success {
            tool_call_id: "c1".into(),
            output: "2401.00001".into(),
        }));
        turn.push(Message::tool_result(ToolResult::Failure {
            tool_call_id: "c2".into(),
            error: ToolError::UnknownTool("missing".into()),
        }));
        turn.commit();

        let body = serde_json::to_value(backend("http://unused").encode_request(&conversation, &[])).unwrap();
        assert_eq!(body["message"], "");
        assert_eq!(body["chat_history"][1]["role"], "CHATBOT");
        assert_eq!(body["chat_history"][1]["tool_calls"][0]["name"], "search_papers");

        let results = body["tool_results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["call"], json!({"name": "search_papers", "parameters": {"topic": "rust"}}));
        assert_eq!(results[0]["outputs"][0]["result"], "2401.00001");
        assert_eq!(results[1]["outputs"][0]["error"], "unknown tool: missing");
    }

    #[test]
    fn earlier_results_stay_in_history() {
        let mut conversation = Conversation::new();
        let mut turn = conversation.begin_turn();
        turn.push(Message::user("q"));
        turn.push(Message::assistant_turn(None, vec![ToolCallRequest::new("c1", "t", json!({}))]));
        turn.push(Message::tool_result(ToolResult::Success {
            tool_call_id: "c1".into(),
            output: "r".into(),
        }));
        turn.push(Message::assistant("done"));
        turn.push(Message::user("next"));
        turn.commit();

        let body = serde_json::to_value(backend("http://unused").encode_request(&conversation, &[])).unwrap();
        let roles: Vec<_> = body["chat_history"].as_array().unwrap().iter().map(|e| e["role"].clone()).collect();
        assert_eq!(roles, [json!("USER"), json!("CHATBOT"), json!("TOOL"), json!("CHATBOT")]);
        assert_eq!(body["message"], "next");
    }

    #[test]
    fn decoded_calls_get_distinct_ids() {
        let response: ChatResponse = serde_json::from_value(json!({
            "text": "",
            "generation_id": "g",
            "tool_calls": [
                {"name": "search_papers", "parameters": {"topic": "a"}},
                {"name": "search_papers", "parameters": {"topic": "b"}}
            ]
        }))
        .unwrap();
        let reply = backend("http://unused").decode_response(response).unwrap();
        assert!(reply.text.is_none());
        assert_eq!(reply.tool_calls.len(), 2);
        assert_ne!(reply.tool_calls[0].id, reply.tool_calls[1].id);
        assert_eq!(reply.tool_calls[1].arguments, json!({"topic": "b"}));
    }

    #[tokio::test]
    async fn rejected_key_is_backend_error() {
        let stub = stub::serve(stub::Reply::Full {
            status: 401,
            body: "{\"message\":\"invalid api token\"}".into(),
        })
        .await;
        let backend = backend(&stub.base_url());
        let err = backend
            .send(backend.encode_request(&Conversation::new(), &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Status { status: 401, .. }));
        assert_eq!(stub.requests()[0].0, "POST /v1/chat HTTP/1.1");
    }
}
