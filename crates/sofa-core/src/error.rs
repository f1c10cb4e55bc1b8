//! Error types for Sofa Core

use sofa_storage::StorageError;
use thiserror::Error;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Document update conflict on {id}: {reason}")]
    Conflict { id: String, reason: String },

    #[error("Malformed revision: {0:?}")]
    MalformedRevision(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    pub(crate) fn conflict(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Conflict {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Errors scoped to one document; a batch can record them and carry on
    pub fn is_document_error(&self) -> bool {
        matches!(
            self,
            Error::Conflict { .. } | Error::MalformedRevision(_) | Error::InvalidDocument(_)
        )
    }

    /// Short machine-readable name, used on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::Conflict { .. } => "conflict",
            Error::MalformedRevision(_) => "bad_revision",
            Error::InvalidDocument(_) => "bad_request",
            Error::Transport(_) => "transport",
            Error::Storage(_) => "storage",
            Error::Serialization(_) => "serialization",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias for Sofa Core operations
pub type Result<T> = std::result::Result<T, Error>;
