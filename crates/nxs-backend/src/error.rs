//! Errors from the hosted platform and the in-memory stand-in.

use std::io;
use thiserror::Error;

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(String),

    /// The platform answered with a non-success status and an error body.
    #[error("API error {status}: {message}")]
    Api {
        status: u16,
        message: String,
        code: Option<String>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Auth error: {0}")]
    Auth(String),

    #[error("Not signed in")]
    NotAuthenticated,

    #[error("Realtime error: {0}")]
    Realtime(String),

    #[error("Subscription closed")]
    SubscriptionClosed,

    #[error("Operation timed out")]
    Timeout,

    #[error("Invalid query: {0}")]
    Query(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Timeout
        } else {
            BackendError::Http(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BackendError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        BackendError::Realtime(err.to_string())
    }
}

impl BackendError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        BackendError::Api {
            status,
            message: message.into(),
            code: None,
        }
    }

    /// Transient: transport failures and overload/gateway statuses.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Api { status, .. } => matches!(status, 408 | 425 | 429 | 502..=504),
            BackendError::Timeout | BackendError::Io(_) | BackendError::Http(_) => true,
            _ => false,
        }
    }

    /// Expired or missing token, or a row-level security refusal.
    #[must_use]
    pub fn is_access_denied(&self) -> bool {
        match self {
            BackendError::Api { status, .. } => *status == 401 || *status == 403,
            BackendError::NotAuthenticated => true,
            _ => false,
        }
    }

    /// Unique constraint violation (Postgres SQLSTATE 23505).
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        match self {
            BackendError::Api { status, code, .. } => {
                *status == 409 || code.as_deref() == Some("23505")
            }
            _ => false,
        }
    }
}
