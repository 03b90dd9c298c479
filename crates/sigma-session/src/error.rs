//! Error types for sigma-session

use thiserror::Error;

use crate::session::SessionKind;

/// Result type alias using sigma-session Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during session operations
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the wire layer
    #[error(transparent)]
    Wire(#[from] sigma_wire::Error),

    /// The model name is not usable for compaction
    #[error("Model does not support compaction: {0:?}")]
    UnsupportedModel(String),

    /// The delegate session kind cannot be wrapped for compaction
    #[error("Compaction requires a client-managed delegate session, got {0:?}")]
    UnsupportedDelegate(SessionKind),

    /// previous_response_id compaction was requested without a response id
    #[error("Compaction in previous_response_id mode requires a response id")]
    MissingResponseId,

    /// An error from a session implementation (string-based for flexibility)
    #[error("Session error: {0}")]
    Session(String),
}

impl Error {
    /// Check if this is a usage error: wrong inputs, never retryable
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedModel(_) | Error::UnsupportedDelegate(_) | Error::MissingResponseId
        )
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Wire(e) => e.is_retryable(),
            _ => false,
        }
    }
}
