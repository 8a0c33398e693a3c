use mcp::ToolError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    ToolResult,
}

/// A tool call requested by the model.
///
/// `arguments` is kept as the backend sent it; the registry checks that it
/// is an object when the call is dispatched.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub tool_name: String,
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            arguments,
        }
    }
}

/// The outcome the engine reported back for one tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResult {
    Success { tool_call_id: String, output: String },
    Failure { tool_call_id: String, error: ToolError },
}

impl ToolResult {
    pub fn tool_call_id(&self) -> &str {
        match self {
            Self::Success { tool_call_id, .. } | Self::Failure { tool_call_id, .. } => tool_call_id,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }

    /// Text shown to the model.
    pub fn content(&self) -> String {
        match self {
            Self::Success { output, .. } => output.clone(),
            Self::Failure { error, .. } => format!("Error: {error}"),
        }
    }
}

/// A part of a message, which can be text or a tool interaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    ToolCall(ToolCallRequest),
    ToolResult(ToolResult),
}

/// A message, consisting of a role and one or more parts.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self::text_message(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text_message(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text_message(Role::Assistant, text)
    }

    /// An assistant turn that asked for tools, preserved as the model sent it.
    pub fn assistant_turn(text: Option<String>, calls: Vec<ToolCallRequest>) -> Self {
        let mut parts = Vec::with_capacity(calls.len() + 1);
        if let Some(text) = text.filter(|t| !t.is_empty()) {
            parts.push(Part::Text(text));
        }
        parts.extend(calls.into_iter().map(Part::ToolCall));
        Self {
            role: Role::Assistant,
            parts,
        }
    }

    pub fn tool_result(result: ToolResult) -> Self {
        Self {
            role: Role::ToolResult,
            parts: vec![Part::ToolResult(result)],
        }
    }

    fn text_message(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![Part::Text(text.into())],
        }
    }

    /// Get combined text content from all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// All tool calls in this message.
    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCallRequest> {
        self.parts.iter().filter_map(|part| match part {
            Part::ToolCall(call) => Some(call),
            _ => None,
        })
    }

    /// The tool result carried by a `ToolResult` message.
    pub fn result(&self) -> Option<&ToolResult> {
        self.parts.iter().find_map(|part| match part {
            Part::ToolResult(result) => Some(result),
            _ => None,
        })
    }

    /// Id of the call a tool result answers.
    pub fn originating_tool_call_id(&self) -> Option<&str> {
        self.result().map(ToolResult::tool_call_id)
    }
}

/// A backend reply translated out of its wire format.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedReply {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}

impl DecodedReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn calls(tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            text: None,
            tool_calls,
        }
    }
}

/// Id for backends that do not label their tool calls.
pub(crate) fn synthetic_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_text_extraction() {
        let msg = Message {
            role: Role::Assistant,
            parts: vec![
                Part::Text("Hello ".into()),
                Part::ToolCall(ToolCallRequest::new("1", "test", Value::Null)),
                Part::Text("world".into()),
            ],
        };
        assert_eq!(msg.text(), "Hello world");
    }

    #[test]
    fn assistant_turn_keeps_call_order() {
        let msg = Message::assistant_turn(
            Some("Let me help".into()),
            vec![
                ToolCallRequest::new("1", "search", json!({"q": "rust"})),
                ToolCallRequest::new("2", "read", json!({"path": "a"})),
            ],
        );
        let names: Vec<_> = msg.tool_calls().map(|c| c.tool_name.as_str()).collect();
        assert_eq!(names, ["search", "read"]);
        assert_eq!(msg.text(), "Let me help");
    }

    #[test]
    fn empty_text_is_dropped_from_assistant_turn() {
        let msg = Message::assistant_turn(
            Some(String::new()),
            vec![ToolCallRequest::new("1", "t", json!({}))],
        );
        assert_eq!(msg.parts.len(), 1);
    }

    #[test]
    fn tool_result_carries_call_id() {
        let ok = Message::tool_result(ToolResult::Success {
            tool_call_id: "c1".into(),
            output: "done".into(),
        });
        assert_eq!(ok.role, Role::ToolResult);
        assert_eq!(ok.originating_tool_call_id(), Some("c1"));
        assert_eq!(ok.result().unwrap().content(), "done");

        let failed = ToolResult::Failure {
            tool_call_id: "c2".into(),
            error: ToolError::UnknownTool("nope".into()),
        };
        assert!(failed.is_error());
        assert_eq!(failed.content(), "Error: unknown tool: nope");
    }

    #[test]
    fn synthetic_ids_are_unique() {
        assert_ne!(synthetic_call_id(), synthetic_call_id());
    }
}
