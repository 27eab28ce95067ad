//! Shared error types for the classroom control plane.

use thiserror::Error;

/// Low-level errors that cut across components: database, serialization,
/// transport. Component-level code (`meeting-controller::errors::
/// ControlPlaneError`) wraps these with the operation-specific context a
/// caller needs to decide what to do next.
#[derive(Error, Debug)]
pub enum CommonError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(String),

    /// Network transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Unauthorized access
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using `CommonError`
pub type Result<T> = std::result::Result<T, CommonError>;
