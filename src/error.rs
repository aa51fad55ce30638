//! Error taxonomy for the identity core and its HTTP rendering.
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Email already in use")]
    DuplicateAccount,

    #[error("user not found")]
    NotFound,

    #[error("invalid credential")]
    InvalidCredential,

    #[error("Current password is required")]
    CurrentPasswordRequired,

    #[error("Incorrect current password")]
    IncorrectCurrentPassword,

    #[error("New password cannot be the same as the old password")]
    PasswordUnchanged,

    #[error("Invalid or unknown reset token")]
    TokenNotFound,

    #[error("Reset token has expired")]
    TokenExpired,

    #[error("{0}")]
    InvalidImage(String),

    #[error("File size exceeds the limit (5MB).")]
    PayloadTooLarge,

    #[error("Provided image URL is not accessible: {0}")]
    ResourceUnreachable(String),

    #[error("Image storage is unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    ExpiredToken,

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type AuthResult<T> = Result<T, AuthError>;

/// Message shown for every failed login, whatever the cause.
pub const LOGIN_FAILED: &str = "Login failed! Invalid email or password";

impl AuthError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::DuplicateAccount => StatusCode::CONFLICT,
            AuthError::NotFound
            | AuthError::InvalidCredential
            | AuthError::InvalidToken
            | AuthError::ExpiredToken => StatusCode::UNAUTHORIZED,
            AuthError::CurrentPasswordRequired
            | AuthError::IncorrectCurrentPassword
            | AuthError::PasswordUnchanged
            | AuthError::TokenNotFound
            | AuthError::TokenExpired
            | AuthError::Validation(_) => StatusCode::BAD_REQUEST,
            AuthError::InvalidImage(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AuthError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AuthError::ResourceUnreachable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AuthError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            AuthError::DuplicateAccount => "ACCOUNT_EXISTS",
            AuthError::NotFound | AuthError::InvalidCredential => "LOGIN_FAILED",
            AuthError::CurrentPasswordRequired => "CURRENT_PASSWORD_REQUIRED",
            AuthError::IncorrectCurrentPassword => "INCORRECT_CURRENT_PASSWORD",
            AuthError::PasswordUnchanged => "PASSWORD_UNCHANGED",
            AuthError::TokenNotFound => "RESET_TOKEN_NOT_FOUND",
            AuthError::TokenExpired => "RESET_TOKEN_EXPIRED",
            AuthError::InvalidImage(_) => "INVALID_IMAGE",
            AuthError::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            AuthError::ResourceUnreachable(_) => "RESOURCE_UNREACHABLE",
            AuthError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            AuthError::InvalidToken => "INVALID_TOKEN",
            AuthError::ExpiredToken => "EXPIRED_TOKEN",
            AuthError::Validation(_) => "VALIDATION",
            AuthError::Internal(_) => "INTERNAL",
        }
    }

    /// Text safe to show to the caller.
    pub fn client_message(&self) -> String {
        match self {
            AuthError::NotFound | AuthError::InvalidCredential => LOGIN_FAILED.to_string(),
            AuthError::ResourceUnreachable(_) => "Provided image URL is not accessible".into(),
            AuthError::StorageUnavailable(_) => "Image storage is unavailable".into(),
            AuthError::Internal(_) => "An unexpected error occurred.".into(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            AuthError::Internal(e) => error!(error = ?e, "unhandled internal error"),
            AuthError::StorageUnavailable(detail) => {
                error!(detail = %detail, "object storage failure")
            }
            _ => {}
        }

        let body = serde_json::json!({
            "error": {
                "code": self.error_code(),
                "message": self.client_message(),
            }
        });
        (status, Json(body)).into_response()
    }
}
