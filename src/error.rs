use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Malformed data: {0}")]
    Malformed(String),

    #[error("Tool failure: {tool}: {message}")]
    ToolFailure { tool: String, message: String },

    #[error("First entry took {elapsed:?} (limit {limit:?}), external tools appear hung")]
    HangDetected { elapsed: Duration, limit: Duration },

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported feature: {0}")]
    Unsupported(String),
}

impl PatchError {
    pub fn malformed(message: impl Into<String>) -> Self {
        PatchError::Malformed(message.into())
    }

    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        PatchError::ToolFailure {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Errors that abort the whole run instead of falling back for one asset.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PatchError::NotFound(_) | PatchError::HangDetected { .. })
    }
}

pub type Result<T> = std::result::Result<T, PatchError>;
