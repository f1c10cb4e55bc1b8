//! Protocol error types

use thiserror::Error;

/// Protocol-specific errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Missing argument: {0}")]
    MissingArgument(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Message too large: {size} > {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("{0}")]
    Core(#[from] sofa_core::Error),
}

impl ProtocolError {
    /// Error code sent in `-ERR <code> <message>`
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::InvalidCommand(_) => "INVALID_CMD",
            ProtocolError::MissingArgument(_) | ProtocolError::InvalidArgument(_) => "INVALID_ARG",
            ProtocolError::MessageTooLarge { .. } => "TOO_LARGE",
            ProtocolError::InvalidJson(_) => "INVALID_JSON",
            ProtocolError::Core(e) => core_code(e),
        }
    }
}

/// Wire code for a core error
pub fn core_code(error: &sofa_core::Error) -> &'static str {
    use sofa_core::Error;
    match error {
        Error::NotFound(_) => "NOT_FOUND",
        Error::Conflict { .. } => "CONFLICT",
        Error::MalformedRevision(_) => "BAD_REVISION",
        Error::InvalidDocument(_) => "BAD_REQUEST",
        Error::Transport(_) => "TRANSPORT",
        Error::Storage(_) => "STORAGE",
        Error::Serialization(_) => "SERIALIZATION",
    }
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
