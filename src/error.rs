use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::utils::{error_codes, error_to_api_response};

/// The four failure families every workflow reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PreconditionFailed,
    PermissionDenied,
    NotFound,
    WriteFailed,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("user is already a member of this group")]
    AlreadyMember,
    #[error("a pending request already exists for this group")]
    DuplicateRequest,
    #[error("this message was already reported by the user")]
    DuplicateReport,
    #[error("user is not a member of this group")]
    NotAMember,
    #[error("the group has reached its capacity")]
    GroupFull,
    #[error("user does not meet the age requirements of this group")]
    AgeRestricted,
    #[error("request was already {0}")]
    RequestAlreadyResolved(&'static str),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("permission denied: {0}")]
    PermissionDenied(&'static str),
    #[error("unauthorized")]
    Unauthorized,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("store operation failed: {0}")]
    WriteFailed(String),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::AlreadyMember
            | AppError::DuplicateRequest
            | AppError::DuplicateReport
            | AppError::NotAMember
            | AppError::GroupFull
            | AppError::AgeRestricted
            | AppError::RequestAlreadyResolved(_)
            | AppError::Validation(_) => ErrorKind::PreconditionFailed,
            AppError::PermissionDenied(_) | AppError::Unauthorized => ErrorKind::PermissionDenied,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::WriteFailed(_) => ErrorKind::WriteFailed,
        }
    }

    fn status_and_code(&self) -> (StatusCode, i32) {
        match self {
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, error_codes::VALIDATION_ERROR),
            AppError::NotAMember => (StatusCode::FORBIDDEN, error_codes::NOT_A_MEMBER),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, error_codes::AUTH_FAILED),
            AppError::PermissionDenied(_) => {
                (StatusCode::FORBIDDEN, error_codes::PERMISSION_DENIED)
            }
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, error_codes::NOT_FOUND),
            AppError::WriteFailed(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, error_codes::INTERNAL_ERROR)
            }
            _ => (StatusCode::CONFLICT, error_codes::PRECONDITION_FAILED),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::WriteFailed(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::WriteFailed(format!("serialization: {}", e))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        // Store failures keep their detail in the logs only
        let msg = match &self {
            AppError::WriteFailed(detail) => {
                tracing::error!("Store failure: {}", detail);
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        (status, error_to_api_response::<()>(code, msg)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
