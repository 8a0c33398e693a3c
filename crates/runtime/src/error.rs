use thiserror::Error;

use crate::model::BackendError;

/// Why a turn ended without an answer.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("model kept requesting tools after {rounds} rounds")]
    ToolResolutionExhausted { rounds: usize },

    #[error("turn cancelled")]
    Cancelled,
}

impl TurnError {
    /// Whether the conversation kept messages from this turn.
    pub fn keeps_transcript(&self) -> bool {
        matches!(self, Self::ToolResolutionExhausted { .. })
    }
}

pub type Result<T> = std::result::Result<T, TurnError>;
