//! CLI error types.

use thiserror::Error;

use crate::config::ConfigError;

/// CLI errors.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration is invalid or missing required fields.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Servers were configured but none of them contributed a tool.
    #[error("none of the {configured} configured tool providers came up")]
    NoTools { configured: usize },

    /// The backend answered the probe but does not list the model.
    #[error("model '{model}' is not available at {endpoint}")]
    ModelUnavailable { model: String, endpoint: String },

    /// An error talking to the model backend.
    #[error(transparent)]
    Backend(#[from] runtime::BackendError),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
