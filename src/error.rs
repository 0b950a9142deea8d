//! Error types for the Ratewarden service.

use thiserror::Error;

/// Main error type for Ratewarden operations.
#[derive(Error, Debug)]
pub enum RatewardenError {
    /// Malformed caller input, rejected before any store access
    #[error("Validation error: {0}")]
    Validation(String),

    /// The shared state store could not be reached
    #[error("Store connection error: {0}")]
    Connection(String),

    /// The store was reachable but the operation failed server-side
    #[error("Store operation error: {0}")]
    Operation(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RatewardenError {
    /// Whether this error means the limiter itself is degraded, as opposed to
    /// the caller having sent bad input.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Operation(_))
    }
}

impl From<redis::RedisError> for RatewardenError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            Self::Connection(err.to_string())
        } else {
            Self::Operation(err.to_string())
        }
    }
}

impl From<config::ConfigError> for RatewardenError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, RatewardenError>;
