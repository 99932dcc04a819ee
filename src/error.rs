//! Error types for QuotaGuard.

use thiserror::Error;

/// Main error type for QuotaGuard operations.
#[derive(Error, Debug)]
pub enum QuotaGuardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A geo provider name that is not one of the known variants
    #[error("Unknown geo provider: {0}")]
    UnknownProvider(String),

    /// Errors from the Redis counter store
    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    /// Geo lookup errors raised by custom providers
    #[error("Geo lookup error: {0}")]
    Geo(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for QuotaGuard operations.
pub type Result<T> = std::result::Result<T, QuotaGuardError>;
