use nxs_backend::BackendError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChatError>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ChatError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("{0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not allowed: {0}")]
    Forbidden(String),

    #[error("Messaging is blocked between these users")]
    Blocked,

    #[error("{0} is disabled")]
    Disabled(String),

    #[error("Failed to decode {table} row: {message}")]
    Decode { table: String, message: String },

    #[error("Local storage error: {0}")]
    Local(#[from] anyhow::Error),
}

impl ChatError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ChatError::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        ChatError::NotFound(what.into())
    }

    pub fn forbidden(why: impl Into<String>) -> Self {
        ChatError::Forbidden(why.into())
    }

    /// True for failures worth retrying later (network, throttling).
    pub fn is_transient(&self) -> bool {
        matches!(self, ChatError::Backend(e) if e.is_retryable())
    }

    /// True when the session is missing or no longer accepted.
    pub fn is_auth(&self) -> bool {
        matches!(self, ChatError::Backend(e) if e.is_access_denied())
    }
}
