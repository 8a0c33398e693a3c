//! Conversation state.

use crate::model::{Message, Role};

/// The ordered transcript of one conversation.
///
/// Messages are only ever appended. A turn in progress appends through a
/// [`TurnGuard`], which truncates back to where the turn started unless the
/// turn is committed.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<Message>,
    turn_count: usize,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a conversation seeded with a system prompt.
    pub fn with_system(prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(prompt)],
            turn_count: 0,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Number of completed turns.
    pub fn turn_count(&self) -> usize {
        self.turn_count
    }

    /// Combined text of all system messages, if any.
    pub fn system_prompt(&self) -> Option<String> {
        let prompts: Vec<String> = self
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(Message::text)
            .filter(|t| !t.is_empty())
            .collect();
        (!prompts.is_empty()).then(|| prompts.join("\n\n"))
    }

    /// Messages other than system prompts, in transcript order.
    pub fn dialogue(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.role != Role::System)
    }

    pub(crate) fn begin_turn(&mut self) -> TurnGuard<'_> {
        let checkpoint = self.messages.len();
        TurnGuard {
            conversation: self,
            checkpoint,
            committed: false,
        }
    }
}

/// Appends on behalf of one turn. Dropped without [`commit`](Self::commit),
/// every message the turn added is removed again.
pub(crate) struct TurnGuard<'a> {
    conversation: &'a mut Conversation,
    checkpoint: usize,
    committed: bool,
}

impl TurnGuard<'_> {
    pub(crate) fn push(&mut self, message: Message) {
        self.conversation.messages.push(message);
    }

    pub(crate) fn conversation(&self) -> &Conversation {
        self.conversation
    }

    pub(crate) fn commit(mut self) {
        self.committed = true;
        self.conversation.turn_count += 1;
    }
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.conversation.messages.truncate(self.checkpoint);
        }
    }
}
