//! Conversation types and backend errors.

pub mod errors;
pub mod types;

pub use errors::BackendError;
pub(crate) use types::synthetic_call_id;
pub use types::{DecodedReply, Message, Part, Role, ToolCallRequest, ToolResult};
