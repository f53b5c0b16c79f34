//! Error taxonomy.
//!
//! `VigilError` covers infrastructure and input failures. Per-send outcomes are
//! not errors in that sense: they are `SendError` values that drive the
//! notification state machine.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, VigilError>;

#[derive(Debug, Error)]
pub enum VigilError {
    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("invalid date: {0}")]
    InvalidDate(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("channel not configured: {0}")]
    ChannelUnconfigured(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Outcome of a failed channel send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendError {
    /// Whether another attempt could succeed.
    pub retryable: bool,
    pub message: String,
}

impl SendError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.retryable {
            write!(f, "{} (retryable)", self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for SendError {}

impl From<VigilError> for SendError {
    fn from(err: VigilError) -> Self {
        match err {
            VigilError::ChannelUnconfigured(_)
            | VigilError::InvalidDate(_)
            | VigilError::InvalidInput(_)
            | VigilError::NotFound(_) => {
                SendError::permanent(err.to_string())
            }
            other => SendError::retryable(other.to_string()),
        }
    }
}
