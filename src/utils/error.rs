use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use crate::admission::{GenerationError, RegistrationError};
use crate::store::StoreError;
use crate::utils::response::error as error_response;

/// Outcome codes carried by admission responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidInput,
    TicketNotFound,
    AlreadyUsed,
    DuplicateScan,
    OrphanedTicket,
    AdmissionFailed,
    VerificationFailed,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::TicketNotFound => "TICKET_NOT_FOUND",
            ErrorCode::AlreadyUsed => "ALREADY_USED",
            ErrorCode::DuplicateScan => "DUPLICATE_SCAN",
            ErrorCode::OrphanedTicket => "ORPHANED_TICKET",
            ErrorCode::AdmissionFailed => "ADMISSION_FAILED",
            ErrorCode::VerificationFailed => "VERIFICATION_FAILED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Resolved outcomes (the identifier matched a real ticket) answer 200 so
    /// scanners always get a body to render.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::AlreadyUsed | ErrorCode::DuplicateScan => StatusCode::OK,
            ErrorCode::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorCode::TicketNotFound => StatusCode::NOT_FOUND,
            ErrorCode::OrphanedTicket => StatusCode::CONFLICT,
            ErrorCode::VerificationFailed => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::AdmissionFailed | ErrorCode::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::InvalidInput => "A ticket identifier is required",
            ErrorCode::TicketNotFound => "No ticket matches this code",
            ErrorCode::AlreadyUsed => "Welcome back! This ticket has already been scanned",
            ErrorCode::DuplicateScan => "Ticket was scanned a moment ago, please wait",
            ErrorCode::OrphanedTicket => "Ticket record is incomplete, contact support",
            ErrorCode::AdmissionFailed => "Admission could not be recorded",
            ErrorCode::VerificationFailed => "Ticket could not be verified",
            ErrorCode::InternalError => "Unexpected error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage error")]
    StoreError(#[from] StoreError),

    #[error("Internal server error")]
    InternalServerError(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::StoreError(e) if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            AppError::StoreError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::ValidationError(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::StoreError(_) => "DATABASE_ERROR",
            AppError::InternalServerError(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    fn log(&self) {
        match self {
            AppError::ValidationError(msg)
            | AppError::NotFound(msg)
            | AppError::Conflict(msg)
            | AppError::InternalServerError(msg) => {
                error!(error = ?self, message = %msg, "Application error");
            }
            AppError::StoreError(e) => {
                error!(error = ?e, "Store error");
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();

        self.log();

        let public_message = match &self {
            AppError::ValidationError(msg)
            | AppError::NotFound(msg)
            | AppError::Conflict(msg)
            | AppError::InternalServerError(msg) => msg.clone(),
            AppError::StoreError(_) => "A database error occurred".to_string(),
        };

        error_response(code, public_message, None, status)
    }
}

impl From<RegistrationError> for AppError {
    fn from(err: RegistrationError) -> Self {
        match err {
            RegistrationError::Invalid(msg) => AppError::ValidationError(msg),
            RegistrationError::UnknownTicketType(_) => AppError::NotFound(err.to_string()),
            RegistrationError::Store(e) => AppError::StoreError(e),
        }
    }
}

impl From<GenerationError> for AppError {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::PurchaseNotFound(_) => AppError::NotFound(err.to_string()),
            GenerationError::NotIndividual(_) | GenerationError::TooManyAdmissions(_) => {
                AppError::Conflict(err.to_string())
            }
            GenerationError::Store(e) => AppError::StoreError(e),
        }
    }
}
