//! MCP protocol types (JSON-RPC 2.0 based).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol revision announced during `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: id.into(),
            method: method.into(),
            params: None,
        }
    }
}

/// JSON-RPC 2.0 notification (a request without an id).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params: None,
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Successful response carrying `result`.
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Error response.
    pub fn failure(id: RequestId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Returns the result if successful, or an error.
    ///
    /// Note: JSON-RPC 2.0 requires `result` on success, but some MCP servers
    /// omit it for void methods. We treat missing result as `null` rather than
    /// an error for compatibility.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        if let Some(error) = self.error {
            Err(error)
        } else {
            Ok(self.result.unwrap_or(Value::Null))
        }
    }
}

/// JSON-RPC 2.0 error.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub const METHOD_NOT_FOUND: i64 = -32601;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = self.code;
        let message = &self.message;
        write!(f, "[{code}] {message}")
    }
}

impl std::error::Error for JsonRpcError {}

/// Request ID (can be string or number).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

/// A single line received from a provider, classified by shape.
#[derive(Debug, Clone)]
pub enum Incoming {
    /// Reply to one of our requests.
    Response(JsonRpcResponse),
    /// Server-initiated request that expects a reply.
    Request { id: RequestId, method: String },
    /// Server-initiated notification.
    Notification { method: String },
}

#[derive(Deserialize)]
struct RawIncoming {
    #[serde(default)]
    id: Option<RequestId>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

impl Incoming {
    /// Parse one newline-delimited JSON-RPC message.
    pub fn parse(line: &str) -> serde_json::Result<Self> {
        let raw: RawIncoming = serde_json::from_str(line)?;
        let incoming = match (raw.id, raw.method) {
            (Some(id), Some(method)) => Self::Request { id, method },
            (None, Some(method)) => Self::Notification { method },
            (Some(id), None) => Self::Response(JsonRpcResponse {
                jsonrpc: "2.0".to_string(),
                id,
                result: raw.result,
                error: raw.error,
            }),
            (None, None) => {
                return Err(serde::de::Error::custom(
                    "message has neither an id nor a method",
                ));
            }
        };
        Ok(incoming)
    }
}

// --- MCP-specific types ---

/// MCP initialize request params.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: ClientCapabilities,
    pub client_info: ClientInfo,
}

impl Default for InitializeParams {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: ClientInfo {
                name: "conduit".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

/// Client capabilities sent during initialization.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientCapabilities {}

/// Client info sent during initialization.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// MCP initialize response result.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    pub server_info: ServerInfo,
    #[serde(default)]
    pub instructions: Option<String>,
}

/// Server capabilities returned during initialization.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerCapabilities {
    #[serde(default)]
    pub tools: Option<ToolsCapability>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCapability {
    #[serde(default)]
    pub list_changed: bool,
}

/// Server info returned during initialization.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Tool definition returned by tools/list.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub input_schema: Value,
}

/// Params for tools/list.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ListToolsParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// Result of tools/list.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    pub tools: Vec<Tool>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Params for tools/call.
#[derive(Debug, Clone, Serialize)]
pub struct CallToolParams {
    pub name: String,
    pub arguments: serde_json::Map<String, Value>,
}

/// Result of tools/call.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(default)]
    pub is_error: bool,
}

impl CallToolResult {
    /// Flatten the content blocks into a single string.
    ///
    /// Text blocks are joined with newlines; other blocks are rendered as
    /// their JSON form so nothing the provider returned is lost.
    pub fn render(&self) -> String {
        self.content
            .iter()
            .map(|block| match block.as_text() {
                Some(text) => text.to_string(),
                None => serde_json::to_string(block).unwrap_or_default(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Content returned by a tool.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: EmbeddedResource,
    },
    #[serde(other)]
    Unknown,
}

/// Resource contents embedded in a tool result.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddedResource {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ToolContent {
    /// Create a text content block.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Get text content if this is a text content block.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ToolContent::Text { text } => Some(text),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_request() {
        let mut req = JsonRpcRequest::new(1i64, "initialize");
        req.params = Some(serde_json::to_value(InitializeParams::default()).unwrap());
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"method\":\"initialize\""));
        assert!(json.contains("\"protocolVersion\":\"2024-11-05\""));
    }

    #[test]
    fn classify_incoming_messages() {
        let response = Incoming::parse(r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#).unwrap();
        assert!(matches!(response, Incoming::Response(r) if r.id == RequestId::Number(1)));

        let request = Incoming::parse(r#"{"jsonrpc":"2.0","id":"s-1","method":"ping"}"#).unwrap();
        assert!(matches!(request, Incoming::Request { method, .. } if method == "ping"));

        let note =
            Incoming::parse(r#"{"jsonrpc":"2.0","method":"notifications/message"}"#).unwrap();
        assert!(matches!(note, Incoming::Notification { .. }));

        assert!(Incoming::parse(r#"{"jsonrpc":"2.0"}"#).is_err());
        assert!(Incoming::parse("starting server...").is_err());
    }

    #[test]
    fn deserialize_tool() {
        let json = r#"{
            "name": "read_file",
            "description": "Read a file",
            "inputSchema": {"type": "object", "properties": {"path": {"type": "string"}}}
        }"#;
        let tool: Tool = serde_json::from_str(json).unwrap();
        assert_eq!(tool.name, "read_file");
    }

    #[test]
    fn render_mixed_content() {
        let result: CallToolResult = serde_json::from_str(
            r#"{"content":[
                {"type":"text","text":"a.txt"},
                {"type":"text","text":"b.txt"},
                {"type":"image","data":"AAAA","mimeType":"image/png"},
                {"type":"audio","data":"AAAA"}
            ]}"#,
        )
        .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.content[3], ToolContent::Unknown);

        let rendered = result.render();
        assert!(rendered.starts_with("a.txt\nb.txt\n"));
        assert!(rendered.contains("\"mimeType\":\"image/png\""));
    }
}
