//! Error taxonomy: engine-level signals, service-layer failures, and the
//! HTTP mapping. Contention losses and stale guards never appear here — they
//! are silent no-ops inside the engine; what surfaces is always an
//! actionable caller error.

use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;
use validator::ValidationErrors;

use crate::engine::phase::RoomPhase;
use crate::store::StoreError;

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The underlying store failed.
    #[error("store operation failed: {0}")]
    Store(#[from] StoreError),
    /// The operation is not valid in the room's current phase.
    #[error("operation requires the {expected} phase, current phase is {actual}")]
    InvalidPhase {
        /// Phase the operation requires.
        expected: &'static str,
        /// Phase the room was actually in.
        actual: RoomPhase,
    },
    /// A controller-only operation was attempted by another participant.
    #[error("participant `{0}` is not the room controller")]
    NotController(Uuid),
    /// The actor is locked out after a rejected answer.
    #[error("participant `{actor}` is locked out until {until}")]
    Penalized {
        /// The penalized actor.
        actor: Uuid,
        /// Store-clock instant at which the lockout ends.
        until: i64,
    },
    /// Another actor already holds the turn lock.
    #[error("another actor already holds the turn lock")]
    LockHeld,
    /// The operation needs a held lock and none exists.
    #[error("no lock is currently held for this turn")]
    LockNotHeld,
    /// The turn was already resolved by a concurrent controller.
    #[error("the turn was already resolved")]
    AlreadyResolved,
    /// The room has been closed by its controller.
    #[error("room is closed")]
    RoomClosed,
    /// No participant record exists for this identity.
    #[error("unknown participant `{0}`")]
    UnknownParticipant(Uuid),
    /// The vote choice does not name a proposal option.
    #[error("`{0}` is not an option of the current proposal")]
    UnknownOption(String),
    /// No turn record exists yet.
    #[error("no turn is currently open")]
    MissingTurn,
    /// A vote operation arrived while no proposal is open.
    #[error("no proposal is currently open")]
    MissingProposal,
}

/// Errors that can occur in service layer operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Engine rejected the operation.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// Unauthorized access attempt.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Invalid input provided by the client.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Operation cannot be performed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),
}

impl From<ValidationErrors> for AppError {
    fn from(err: ValidationErrors) -> Self {
        AppError::BadRequest(format!("validation failed: {}", err))
    }
}

/// Application-level errors that are converted to HTTP responses.
#[derive(Debug, Error)]
pub enum AppError {
    /// Bad request with invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Unauthorized access attempt.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Requested resource not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// Conflict with current state.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Engine(engine) => engine.into(),
            ServiceError::Unauthorized(message) => AppError::Unauthorized(message),
            ServiceError::InvalidInput(message) => AppError::BadRequest(message),
            ServiceError::InvalidState(message) => AppError::Conflict(message),
            ServiceError::NotFound(message) => AppError::NotFound(message),
        }
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        let message = err.to_string();
        match err {
            EngineError::Store(_) => AppError::Internal(message),
            EngineError::NotController(_) => AppError::Unauthorized(message),
            EngineError::UnknownParticipant(_) => AppError::NotFound(message),
            EngineError::UnknownOption(_) => AppError::BadRequest(message),
            EngineError::InvalidPhase { .. }
            | EngineError::Penalized { .. }
            | EngineError::LockHeld
            | EngineError::LockNotHeld
            | EngineError::AlreadyResolved
            | EngineError::RoomClosed
            | EngineError::MissingTurn
            | EngineError::MissingProposal => AppError::Conflict(message),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let payload = Json(ErrorBody {
            message: self.to_string(),
        });

        (status, payload).into_response()
    }
}
