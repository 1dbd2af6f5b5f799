//! Error types for fieldsync
//!
//! Registry and transport operations return these typed failures. Retry and
//! backoff decisions belong to the caller (uploader, synchronizer, UI).

use std::path::PathBuf;
use thiserror::Error;

/// Library error
#[derive(Error, Debug)]
pub enum Error {
    /// Bad input to a registry operation
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Operation targeted a row that does not exist
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// A live form row already points at this definition file
    #[error("A form is already registered for {}", path.display())]
    DuplicateForm { path: PathBuf },

    /// Instance status change outside the state machine
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Server answered 401
    #[error("Authentication failed for {url}")]
    Authentication { url: String },

    /// Server declared a content type other than the expected one
    #[error(
        "Content type {actual} returned from {url} is not {expected}. \
         This is often caused by a network proxy. Do you need to log in to your network?"
    )]
    UnexpectedContentType {
        url: String,
        expected: String,
        actual: String,
    },

    /// Non-success HTTP status other than 401
    #[error("Server error {status} from {url}: {message}")]
    Server {
        url: String,
        status: u16,
        message: String,
    },

    /// Transport-level failure (connect, timeout, interrupted body)
    #[error("Network error talking to {url}: {message}")]
    Network { url: String, message: String },

    /// Encrypting a finalized instance failed
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Registry database is unreadable
    #[error("Storage at {} is corrupt: {reason}", path.display())]
    StorageCorruption { path: PathBuf, reason: String },

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Transient failures that a scheduled retry may clear
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Server { .. } | Error::Network { .. })
    }

    /// Failures that need the user to re-enter credentials
    pub fn requires_credentials(&self) -> bool {
        matches!(self, Error::Authentication { .. })
    }

    pub(crate) fn network(url: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Error::Network {
            url: url.into(),
            message: err.to_string(),
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        let server = Error::Server {
            url: "https://example.org".into(),
            status: 500,
            message: "boom".into(),
        };
        assert!(server.is_retryable());
        assert!(!server.requires_credentials());

        let auth = Error::Authentication {
            url: "https://example.org".into(),
        };
        assert!(!auth.is_retryable());
        assert!(auth.requires_credentials());

        assert!(!Error::validation("bad").is_retryable());
    }

    #[test]
    fn test_content_type_message_mentions_proxy() {
        let err = Error::UnexpectedContentType {
            url: "https://example.org/formList".into(),
            expected: "application/json".into(),
            actual: "text/html".into(),
        };
        assert!(err.to_string().contains("network proxy"));
    }
}
