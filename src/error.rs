//! Failure taxonomy shared by every auth flow, and its HTTP rendering.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::auth::repo::StoreError;

/// Coarse classification the transport maps onto a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    Authentication,
    Authorization,
    RateLimited,
    NotFound,
    Persistence,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("{0}")]
    WeakPassword(String),

    #[error("Password confirmation does not match")]
    PasswordMismatch,

    #[error("User already exists with this email")]
    EmailTaken,

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Account is temporarily locked due to too many failed attempts")]
    AccountLocked,

    #[error("Account is deactivated")]
    AccountDeactivated,

    #[error("Missing or malformed Authorization header")]
    MissingCredentials,

    #[error("Invalid refresh token")]
    RefreshTokenInvalid,

    #[error("Refresh token expired")]
    RefreshTokenExpired,

    #[error("Invalid token")]
    TokenInvalid,

    #[error("Token expired")]
    TokenExpired,

    #[error("Current password is incorrect")]
    CurrentPasswordIncorrect,

    #[error("Too many requests. Please try again later.")]
    RateLimited { retry_after: u64 },

    #[error("User not found")]
    UserNotFound,

    #[error("password hashing failed: {0}")]
    HashingFailed(String),

    #[error("storage failure: {0}")]
    Persistence(String),

    #[error("internal failure: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        AuthError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::Validation { .. } | AuthError::WeakPassword(_) | AuthError::PasswordMismatch => {
                ErrorKind::Validation
            }
            AuthError::EmailTaken => ErrorKind::Conflict,
            AuthError::InvalidCredentials
            | AuthError::AccountLocked
            | AuthError::MissingCredentials
            | AuthError::RefreshTokenInvalid
            | AuthError::RefreshTokenExpired
            | AuthError::TokenInvalid
            | AuthError::TokenExpired
            | AuthError::CurrentPasswordIncorrect => ErrorKind::Authentication,
            AuthError::AccountDeactivated => ErrorKind::Authorization,
            AuthError::RateLimited { .. } => ErrorKind::RateLimited,
            AuthError::UserNotFound => ErrorKind::NotFound,
            // Both render as a generic internal failure.
            AuthError::HashingFailed(_) | AuthError::Persistence(_) | AuthError::Internal(_) => {
                ErrorKind::Persistence
            }
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
            ErrorKind::Authorization => StatusCode::FORBIDDEN,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Persistence => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to put in a response body.
    pub fn public_message(&self) -> String {
        match self {
            AuthError::Validation { .. } => "Invalid request payload".into(),
            AuthError::TokenInvalid | AuthError::TokenExpired => "Invalid or expired token".into(),
            AuthError::HashingFailed(_) | AuthError::Persistence(_) | AuthError::Internal(_) => {
                "Internal server error".into()
            }
            other => other.to_string(),
        }
    }

    fn details(&self) -> Option<String> {
        match self {
            AuthError::Validation { field, message } => Some(format!("{field}: {message}")),
            _ => None,
        }
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        AuthError::Persistence(err.to_string())
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }

        let mut body = json!({
            "success": false,
            "error": self.public_message(),
        });
        if let Some(details) = self.details() {
            body["details"] = json!(details);
        }

        let retry_after = match &self {
            AuthError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        };
        if let Some(secs) = retry_after {
            body["retry_after"] = json!(secs);
        }

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
