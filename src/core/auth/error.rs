//! Authentication error taxonomy
//!
//! Every failure the auth core can surface, with its fixed HTTP status and a
//! stable machine-readable code. Messages never distinguish "no such email"
//! from "wrong password".

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::core::auth::jwt::CodecError;
use crate::core::auth::tokens::TokenError;
use crate::core::db::store::StoreError;

/// Authentication and session errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Authentication required")]
    TokenMissing,

    #[error("Malformed token")]
    Malformed,

    #[error("Invalid token signature")]
    InvalidSignature,

    #[error("Token expired")]
    Expired,

    #[error("Invalid token claims")]
    MalformedClaims,

    #[error("Account not found or inactive")]
    AccountInvalid,

    #[error("Account deactivated")]
    AccountDeactivated,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Invalid or expired refresh token")]
    InvalidToken,

    #[error("Insufficient permissions")]
    InsufficientPermissions,

    #[error("Too many login attempts, retry in {retry_after_secs}s")]
    TooManyAttempts { retry_after_secs: u64 },

    #[error("Email already registered")]
    EmailAlreadyExists,

    #[error("Invalid email format")]
    InvalidEmail,

    #[error("Password too short (minimum 8 characters)")]
    PasswordTooShort,

    #[error("Password too weak")]
    PasswordTooWeak,

    #[error("Service temporarily unavailable")]
    Unavailable,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// HTTP status for this error
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::TokenMissing
            | AuthError::Malformed
            | AuthError::InvalidSignature
            | AuthError::Expired
            | AuthError::MalformedClaims
            | AuthError::AccountInvalid
            | AuthError::AccountDeactivated
            | AuthError::InvalidCredentials
            | AuthError::InvalidToken => StatusCode::UNAUTHORIZED,
            AuthError::InsufficientPermissions => StatusCode::FORBIDDEN,
            AuthError::TooManyAttempts { .. } => StatusCode::TOO_MANY_REQUESTS,
            AuthError::EmailAlreadyExists => StatusCode::CONFLICT,
            AuthError::InvalidEmail | AuthError::PasswordTooShort | AuthError::PasswordTooWeak => {
                StatusCode::BAD_REQUEST
            }
            AuthError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable code for clients
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::TokenMissing => "TOKEN_MISSING",
            AuthError::Malformed => "TOKEN_MALFORMED",
            AuthError::InvalidSignature => "INVALID_SIGNATURE",
            AuthError::Expired => "TOKEN_EXPIRED",
            AuthError::MalformedClaims => "MALFORMED_CLAIMS",
            AuthError::AccountInvalid => "ACCOUNT_INVALID",
            AuthError::AccountDeactivated => "ACCOUNT_DEACTIVATED",
            AuthError::InvalidCredentials => "INVALID_CREDENTIALS",
            AuthError::InvalidToken => "INVALID_TOKEN",
            AuthError::InsufficientPermissions => "INSUFFICIENT_PERMISSIONS",
            AuthError::TooManyAttempts { .. } => "TOO_MANY_ATTEMPTS",
            AuthError::EmailAlreadyExists => "EMAIL_EXISTS",
            AuthError::InvalidEmail => "INVALID_EMAIL",
            AuthError::PasswordTooShort => "PASSWORD_TOO_SHORT",
            AuthError::PasswordTooWeak => "PASSWORD_TOO_WEAK",
            AuthError::Unavailable => "SERVICE_UNAVAILABLE",
            AuthError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => AuthError::AccountInvalid,
            StoreError::EmailAlreadyExists => AuthError::EmailAlreadyExists,
            StoreError::Database(e) => {
                tracing::error!("Storage failure: {}", e);
                AuthError::Unavailable
            }
            StoreError::Unavailable(reason) => {
                tracing::error!("Storage unavailable: {}", reason);
                AuthError::Unavailable
            }
        }
    }
}

impl From<CodecError> for AuthError {
    fn from(err: CodecError) -> Self {
        TokenError::from(err).into()
    }
}

impl From<TokenError> for AuthError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Malformed => AuthError::Malformed,
            TokenError::InvalidSignature => AuthError::InvalidSignature,
            TokenError::Expired => AuthError::Expired,
            TokenError::MalformedClaims => AuthError::MalformedClaims,
            TokenError::Encoding(msg) => AuthError::Internal(msg),
        }
    }
}

/// API error response body
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: String,
}

impl ApiError {
    pub fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Internal detail stays in the logs
        let message = match &self {
            AuthError::Internal(detail) => {
                tracing::error!("Internal auth error: {}", detail);
                "Internal error".to_string()
            }
            other => other.to_string(),
        };

        let mut response = (status, Json(ApiError::new(message, self.code()))).into_response();

        if let AuthError::TooManyAttempts { retry_after_secs } = self
            && let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }

        response
    }
}
