//! Unified error types for Coachcast.

use thiserror::Error;

/// Result type alias using CoachcastError.
pub type Result<T> = std::result::Result<T, CoachcastError>;

#[derive(Error, Debug)]
pub enum CoachcastError {
    // Channel errors
    /// Transient provider failure, worth retrying on the same channel.
    #[error("Channel error: {0}")]
    Channel(String),

    /// The provider refused the message; retrying will not help.
    #[error("Channel rejected message: {0}")]
    ChannelRejected(String),

    #[error("Channel not configured: {0}")]
    ChannelNotConfigured(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_secs: Option<u64>,
    },

    // Store errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    // Gateway errors
    #[error("Gateway error: {0}")]
    Gateway(String),

    // General errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl CoachcastError {
    pub fn channel(msg: impl Into<String>) -> Self {
        Self::Channel(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::ChannelRejected(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn rate_limited(msg: impl Into<String>, retry_after_secs: Option<u64>) -> Self {
        Self::RateLimited {
            message: msg.into(),
            retry_after_secs,
        }
    }

    /// Whether a failed send should be attempted again on the same channel.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Channel(_)
                | Self::Http(_)
                | Self::Timeout(_)
                | Self::RateLimited { .. }
                | Self::Store(_)
        )
    }

    /// Provider-supplied wait before the next attempt, in seconds.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs, .. } => *retry_after_secs,
            _ => None,
        }
    }
}
