//! Control plane error types.
//!
//! Error variants map to stable, machine-readable codes carried in error
//! frames sent to clients over the realtime gateway. Internal details are
//! logged server-side but never exposed to a client.

use thiserror::Error;

/// Control plane error type.
///
/// Component boundaries (identity, registry, presence, admission,
/// moderation, hand-raise, gateway) raise this upward; the gateway is the
/// only place that turns it into a wire-level error frame.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    /// No credential was presented where one is required.
    #[error("authentication required")]
    AuthRequired,

    /// The presented credential failed validation.
    #[error("invalid credential: {0}")]
    AuthInvalid(String),

    /// Authenticated, but not permitted to perform the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The entity does not exist, or exists but is not visible to the caller.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation does not apply to the entity's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A uniqueness constraint was violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Join was blocked because the room is locked.
    #[error("room is locked")]
    RoomLocked,

    /// The caller or a downstream consumer could not keep up.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Persistence failure.
    #[error("store error: {0}")]
    Store(String),

    /// A wire frame did not match the shape its `event` expects.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Unexpected failure with no user-facing explanation.
    #[error("internal error")]
    Internal(String),
}

impl ControlPlaneError {
    /// Stable, machine-readable error code carried in error frames.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            ControlPlaneError::AuthRequired | ControlPlaneError::AuthInvalid(_) => 1,
            ControlPlaneError::Forbidden(_) => 2,
            ControlPlaneError::NotFound(_) => 3,
            ControlPlaneError::InvalidState(_) => 4,
            ControlPlaneError::Conflict(_) => 5,
            ControlPlaneError::RoomLocked => 6,
            ControlPlaneError::RateLimited(_) => 7,
            ControlPlaneError::Store(_) | ControlPlaneError::Internal(_) => 8,
            ControlPlaneError::BadRequest(_) => 9,
        }
    }

    /// Short machine-readable label, independent of the numeric code, for
    /// logging and metrics (numeric codes alone are hard to grep for).
    #[must_use]
    pub fn error_type_label(&self) -> &'static str {
        match self {
            ControlPlaneError::AuthRequired => "auth_required",
            ControlPlaneError::AuthInvalid(_) => "auth_invalid",
            ControlPlaneError::Forbidden(_) => "forbidden",
            ControlPlaneError::NotFound(_) => "not_found",
            ControlPlaneError::InvalidState(_) => "invalid_state",
            ControlPlaneError::Conflict(_) => "conflict",
            ControlPlaneError::RoomLocked => "room_locked",
            ControlPlaneError::RateLimited(_) => "rate_limited",
            ControlPlaneError::Store(_) => "store_error",
            ControlPlaneError::BadRequest(_) => "bad_request",
            ControlPlaneError::Internal(_) => "internal",
        }
    }

    /// A message safe to send verbatim to the client.
    ///
    /// User-correctable errors (`RoomLocked`, `AuthInvalid`, `InvalidState`,
    /// `Forbidden`, `Conflict`, `NotFound`, `RateLimited`) are surfaced
    /// verbatim; everything else collapses to a generic message so internal
    /// detail never leaks over the wire.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            ControlPlaneError::AuthRequired => "authentication required".to_string(),
            ControlPlaneError::AuthInvalid(msg)
            | ControlPlaneError::Forbidden(msg)
            | ControlPlaneError::NotFound(msg)
            | ControlPlaneError::InvalidState(msg)
            | ControlPlaneError::Conflict(msg)
            | ControlPlaneError::RateLimited(msg)
            | ControlPlaneError::BadRequest(msg) => msg.clone(),
            ControlPlaneError::RoomLocked => "room is locked".to_string(),
            ControlPlaneError::Store(_) | ControlPlaneError::Internal(_) => {
                "an internal error occurred".to_string()
            }
        }
    }
}

impl From<sqlx::Error> for ControlPlaneError {
    fn from(err: sqlx::Error) -> Self {
        ControlPlaneError::Store(err.to_string())
    }
}

impl From<common::error::CommonError> for ControlPlaneError {
    fn from(err: common::error::CommonError) -> Self {
        match err {
            common::error::CommonError::NotFound(msg) => ControlPlaneError::NotFound(msg),
            common::error::CommonError::Unauthorized(msg) => {
                ControlPlaneError::AuthInvalid(msg)
            }
            common::error::CommonError::Database(msg) => ControlPlaneError::Store(msg),
            other => ControlPlaneError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn error_code_mapping() {
        assert_eq!(ControlPlaneError::AuthRequired.error_code(), 1);
        assert_eq!(ControlPlaneError::AuthInvalid("x".into()).error_code(), 1);
        assert_eq!(ControlPlaneError::Forbidden("x".into()).error_code(), 2);
        assert_eq!(ControlPlaneError::NotFound("x".into()).error_code(), 3);
        assert_eq!(ControlPlaneError::InvalidState("x".into()).error_code(), 4);
        assert_eq!(ControlPlaneError::Conflict("x".into()).error_code(), 5);
        assert_eq!(ControlPlaneError::RoomLocked.error_code(), 6);
        assert_eq!(ControlPlaneError::RateLimited("x".into()).error_code(), 7);
        assert_eq!(ControlPlaneError::Store("x".into()).error_code(), 8);
        assert_eq!(ControlPlaneError::Internal("x".into()).error_code(), 8);
        assert_eq!(ControlPlaneError::BadRequest("x".into()).error_code(), 9);
    }

    #[test]
    fn internal_and_store_errors_hide_detail() {
        let err = ControlPlaneError::Store("connection refused at 10.0.0.5:5432".to_string());
        assert_eq!(err.client_message(), "an internal error occurred");

        let err = ControlPlaneError::Internal("panic in worker".to_string());
        assert_eq!(err.client_message(), "an internal error occurred");
    }

    #[test]
    fn user_correctable_errors_are_verbatim() {
        let err = ControlPlaneError::RoomLocked;
        assert_eq!(err.client_message(), "room is locked");

        let err = ControlPlaneError::InvalidState("meeting has already ended".to_string());
        assert_eq!(err.client_message(), "meeting has already ended");
    }

    #[test]
    fn common_error_conversion_preserves_kind() {
        let err: ControlPlaneError =
            common::error::CommonError::NotFound("meeting".to_string()).into();
        assert!(matches!(err, ControlPlaneError::NotFound(_)));
    }
}
