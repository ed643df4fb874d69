//! Error types for the relay.
//!
//! [`RelayError`] covers the failure modes of one conversation turn; cancellation is not an error
//! and is reported as a stream outcome instead.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    /// Thread token count is above the model's hard ceiling. Never auto-recovered.
    #[error("Context too large: {tokens} tokens exceeds hard limit of {limit}")]
    ContextTooLarge { tokens: usize, limit: usize },

    /// The model kept requesting function/tool calls past the configured limit.
    #[error("Function call loop exceeded limit of {limit} calls")]
    FunctionLoopExceeded { limit: usize },

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Unknown mode: {0}")]
    UnknownMode(String),

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    /// Transport rejected the text because of its rich formatting; retry as plain text.
    #[error("Unsupported formatting: {0}")]
    UnsupportedFormatting(String),

    #[error("Bot error: {0}")]
    Bot(String),

    #[error("Completion error: {0}")]
    Completion(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
