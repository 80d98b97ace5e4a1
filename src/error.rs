//! Error types for the Gatekeeper service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Gatekeeper operations.
///
/// These surface at startup (configuration, store connections, server
/// binding). The admission path itself never returns one of these.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backing store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the counter stores and the block ledger.
///
/// The decision engine recovers from every variant locally: a failing fast
/// store triggers the durable fallback, a failing fallback triggers the
/// configured failure policy.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store did not answer within the configured timeout
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// The store is known to be unreachable
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Redis errors
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// SQL database errors
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The store returned data that could not be interpreted
    #[error("corrupt store data: {0}")]
    Corrupt(String),
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
