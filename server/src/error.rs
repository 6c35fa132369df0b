use axum::http::StatusCode;
use thiserror::Error;

use crate::ledger::LedgerError;

#[derive(Debug, Error)]
pub enum WikiError {
    #[error("No such wiki entry: {0}")]
    NotFound(String),
    #[error("Not allowed: {0}")]
    NotAllowed(String),
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("Store inconsistency: {0}")]
    Inconsistency(String),
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl WikiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            WikiError::NotFound(_) => StatusCode::NOT_FOUND,
            WikiError::NotAllowed(_) => StatusCode::FORBIDDEN,
            WikiError::Validation(_) => StatusCode::BAD_REQUEST,
            WikiError::Inconsistency(_) => StatusCode::INTERNAL_SERVER_ERROR,
            WikiError::Ledger(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable code used in the JSON error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            WikiError::NotFound(_) => "NOT_FOUND",
            WikiError::NotAllowed(_) => "NOT_ALLOWED",
            WikiError::Validation(_) => "INVALID_INPUT",
            WikiError::Inconsistency(_) => "INCONSISTENT",
            WikiError::Ledger(_) => "INTERNAL_ERROR",
        }
    }
}

/// Failure reported by a [`crate::render::Renderer`].
#[derive(Debug, Clone, Error)]
#[error("Unable to render: {0}")]
pub struct RenderError(pub String);
