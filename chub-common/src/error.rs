//! Common error types for Creator Hub

use thiserror::Error;

/// Common result type for Creator Hub operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across Creator Hub services
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Caller is known but not allowed to perform the operation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Operation conflicts with the current state of the resource
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Caller identity missing or unknown
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// External side-channel (email/SMS) failure
    #[error("Channel error: {0}")]
    Channel(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}
