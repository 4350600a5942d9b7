//! Engine-level errors.
//!
//! Adapter errors ([`SessionError`], [`BridgeError`], [`DiscoveryError`]) stay
//! close to the process or network call that produced them. [`SpeakerError`] is
//! what the engine surfaces to callers; the HTTP layer renders it as
//! `{error, message, status}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::airplay::discovery::DiscoveryError;
use crate::airplay::traits::{BridgeError, SessionError};
use crate::airplay::types::SpeakerId;

/// Stable snake_case identifier for an error, independent of its message.
pub trait ErrorCode {
    fn code(&self) -> &'static str;
}

impl ErrorCode for DiscoveryError {
    fn code(&self) -> &'static str {
        match self {
            Self::MdnsDaemon(_) => "mdns_daemon_failed",
            Self::Browse { .. } => "mdns_browse_failed",
        }
    }
}

impl ErrorCode for SessionError {
    fn code(&self) -> &'static str {
        match self {
            Self::BinaryNotFound(_) => "binary_not_found",
            Self::Spawn(_) => "spawn_failed",
            Self::Timeout(_) => "timeout",
            Self::Exited(_) => "process_exited",
            Self::CommandFailed { .. } => "command_failed",
            Self::InvalidResponse(_) => "invalid_response",
            Self::CredentialRejected => "credential_rejected",
            Self::WrongPin => "wrong_pin",
            Self::NotRunning => "not_running",
            Self::Cancelled => "cancelled",
        }
    }
}

impl ErrorCode for BridgeError {
    fn code(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "bridge_unavailable",
            Self::CommandFailed { .. } => "bridge_command_failed",
            Self::InvalidResponse(_) => "bridge_invalid_response",
            Self::Timeout(_) => "bridge_timeout",
        }
    }
}

/// Application-wide error type for speaker control.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum SpeakerError {
    /// The session process could not be started.
    #[error("Failed to start session for {id}: {reason}")]
    SpawnFailure { id: SpeakerId, reason: String },

    /// A health check failed.
    #[error("Health check failed for {id}: {reason}")]
    HealthCheckFailure { id: SpeakerId, reason: String },

    /// Pairing exhausted its attempts or the device refused it.
    #[error("Pairing failed for {id}: {reason}")]
    PairingFailed { id: SpeakerId, reason: String },

    /// The user did not supply a PIN within the pairing window.
    #[error("Pairing timed out for {0}")]
    PairingTimeout(SpeakerId),

    /// No pairing flow is waiting for a PIN.
    #[error("No pairing in progress for {0}")]
    PairingNotActive(SpeakerId),

    /// The session is not in a state that accepts commands.
    #[error("Speaker {0} is not ready")]
    SessionNotReady(SpeakerId),

    /// A command argument was rejected before reaching the session.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A state poll failed.
    #[error("Poll failed for {id}: {reason}")]
    PollFailure { id: SpeakerId, reason: String },

    /// The session exhausted its restart budget.
    #[error("Speaker {0} failed permanently; re-discovery or manual restart required")]
    PermanentFailure(SpeakerId),

    /// Unknown speaker id.
    #[error("Speaker not found: {0}")]
    SpeakerNotFound(String),

    /// The session or group leader rejected a command.
    #[error("Command failed for {id}: {reason}")]
    CommandFailed { id: SpeakerId, reason: String },

    /// The command needs a capability this speaker does not offer.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Server configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SpeakerError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SpawnFailure { .. } => "spawn_failure",
            Self::HealthCheckFailure { .. } => "health_check_failure",
            Self::PairingFailed { .. } => "pairing_failed",
            Self::PairingTimeout(_) => "pairing_timeout",
            Self::PairingNotActive(_) => "pairing_not_active",
            Self::SessionNotReady(_) => "session_not_ready",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::PollFailure { .. } => "poll_failure",
            Self::PermanentFailure(_) => "permanent_failure",
            Self::SpeakerNotFound(_) => "speaker_not_found",
            Self::CommandFailed { .. } => "command_failed",
            Self::Unsupported(_) => "unsupported",
            Self::Configuration(_) => "configuration_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::SpeakerNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::PairingFailed { .. } => StatusCode::UNAUTHORIZED,
            Self::PairingTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            Self::PairingNotActive(_) | Self::SessionNotReady(_) => StatusCode::CONFLICT,
            Self::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            Self::PermanentFailure(_) | Self::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::SpawnFailure { .. }
            | Self::HealthCheckFailure { .. }
            | Self::PollFailure { .. }
            | Self::CommandFailed { .. } => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Wraps a backend failure on the command path.
    pub fn command(id: &SpeakerId, err: impl std::fmt::Display) -> Self {
        Self::CommandFailed {
            id: id.clone(),
            reason: err.to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Result Type Aliases
// ─────────────────────────────────────────────────────────────────────────────

pub use crate::airplay::discovery::DiscoveryResult;
pub use crate::airplay::traits::{BridgeResult, SessionResult};

/// Convenient Result alias for application-wide operations.
pub type SpeakerResult<T> = Result<T, SpeakerError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for SpeakerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<DiscoveryError> for SpeakerError {
    fn from(err: DiscoveryError) -> Self {
        Self::Internal(err.to_string())
    }
}
