use std::io;
use std::time::Duration;
use thiserror::Error;

/// Custom error types for the LAN lighting client
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("No reply for source {correlation:#010x} within {after:?}")]
    Timeout {
        /// Source identifier of the request that went unanswered
        correlation: u32,
        /// Deadline that elapsed
        after: Duration,
    },

    #[error("Request with source {0:#010x} was cancelled")]
    Cancelled(u32),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Error::Decode(msg.into())
    }

    /// Creates a new encode error
    pub fn encode(msg: impl Into<String>) -> Self {
        Error::Encode(msg.into())
    }

    /// Creates a new timeout error
    pub fn timeout(correlation: u32, after: Duration) -> Self {
        Error::Timeout { correlation, after }
    }

    /// Creates a new network error
    pub fn network(msg: impl Into<String>) -> Self {
        Error::Network(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Creates a new invalid target error
    pub fn invalid_target(msg: impl Into<String>) -> Self {
        Error::InvalidTarget(msg.into())
    }

    /// Whether this error is a reply deadline elapsing
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}
