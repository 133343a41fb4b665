//! Error types for stillmind-core

use thiserror::Error;

/// Result type alias using stillmind-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in stillmind-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input rejected before any side effect
    #[error("Invalid input: {0}")]
    Validation(String),

    /// No credential is available for an authenticated call
    #[error("Not authenticated")]
    NotAuthenticated,

    /// The server rejected the credential; the session has been invalidated
    #[error("Session expired. Please login again.")]
    SessionExpired,

    /// Magic-link or credential error reported by the auth endpoints
    #[error("Auth error: {0}")]
    Auth(String),

    /// Transport failure
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Non-success HTTP response from the remote service
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Local persistence cannot be reached at all
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Entry not found
    #[error("Entry not found: {0}")]
    NotFound(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create an API error from status and message
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// HTTP status if this is an API error.
    pub const fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the credential was missing or rejected.
    pub const fn is_auth_failure(&self) -> bool {
        matches!(self, Self::NotAuthenticated | Self::SessionExpired)
    }

    /// Whether retrying the same request later can succeed.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Api { status, .. } => matches!(*status, 408 | 425 | 429 | 500..=599),
            _ => false,
        }
    }

    /// Whether this error comes from the local persistence layer.
    pub const fn is_storage(&self) -> bool {
        matches!(
            self,
            Self::StorageUnavailable(_) | Self::Database(_) | Self::LibSql(_) | Self::Io(_)
        )
    }
}
