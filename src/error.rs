//! Error kinds that may cross a stage boundary.
//!
//! Every stage converts its internal failures into one of these before handing
//! anything to the next stage or back to the webhook caller.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The webhook could not be authenticated. Always terminal, answered with 401.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationError {
    #[error("malformed request timestamp {0:?}")]
    MalformedTimestamp(String),
    #[error("request timestamp is {skew_secs}s away from now, suspected replay")]
    ReplaySuspected { skew_secs: u64 },
    #[error("request signature does not match")]
    SignatureMismatch,
    #[error("signing secret is not usable as an HMAC key")]
    InvalidSecret,
}

/// The command was authentic but cannot be run. Answered with 400 and a
/// message only the caller sees.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("Code is required to run")]
    EmptyModalSubmission,
    #[error("No channel available to post the result in")]
    NoCallbackTarget,
    #[error("Malformed request: {0}")]
    MalformedRequest(String),
}

/// A stage or external endpoint could not be reached. Never retried here.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchFailure {
    #[error("{target} is unreachable: {reason}")]
    Unreachable { target: String, reason: String },
    #[error("{target} rejected the invocation: {reason}")]
    Rejected { target: String, reason: String },
    #[error("stage payload could not be encoded or decoded: {0}")]
    Codec(String),
}

/// The sandbox could not produce a result. A guest program exiting non-zero is
/// not one of these.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionError {
    #[error("no runtime registered for {0:?}")]
    UnknownRuntime(String),
    #[error("refusing to run empty code")]
    EmptyCode,
    #[error("scratch storage failure: {0}")]
    StorageFailure(String),
    #[error("failed to start {0}")]
    StartFailure(String),
    #[error("execution exceeded {timeout_ms}ms")]
    ExecutionTimeout { timeout_ms: u64 },
}

/// Failures surfaced by the intake webhook.
#[derive(Error, Debug)]
pub enum IntakeError {
    #[error(transparent)]
    Authentication(#[from] AuthenticationError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Dispatch(#[from] DispatchFailure),
}

impl IntoResponse for IntakeError {
    fn into_response(self) -> Response {
        match self {
            IntakeError::Authentication(_) => StatusCode::UNAUTHORIZED.into_response(),
            IntakeError::Validation(e) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "response_type": "ephemeral",
                    "text": e.to_string(),
                })),
            )
                .into_response(),
            IntakeError::Dispatch(_) => StatusCode::BAD_GATEWAY.into_response(),
        }
    }
}
