/// Unified error types for Gatehouse
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// A single field-level validation failure
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Main error type for the service
#[derive(Error, Debug)]
pub enum AuthError {
    /// Malformed or out-of-policy input
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        fields: Vec<FieldError>,
    },

    /// Unknown account or wrong password; the two are deliberately indistinguishable
    #[error("Invalid email or password")]
    InvalidCredentials,

    /// Account is locked until the given instant (None = until an admin unlocks it)
    #[error("Account is locked")]
    AccountLocked { locked_until: Option<DateTime<Utc>> },

    /// Missing, invalid, expired or revoked token/session
    #[error("Authentication required: {0}")]
    Unauthorized(String),

    /// Authenticated but not allowed
    #[error("Not authorized: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate email/username or a lost write race
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Too many attempts")]
    RateLimited { retry_after: Duration },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Validation error without field detail
    pub fn validation(message: impl Into<String>) -> Self {
        AuthError::Validation {
            message: message.into(),
            fields: Vec::new(),
        }
    }

    /// Stable machine-readable code used in the response envelope
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::Validation { .. } => "VALIDATION_ERROR",
            AuthError::InvalidCredentials => "INVALID_CREDENTIALS",
            AuthError::AccountLocked { .. } => "ACCOUNT_LOCKED",
            AuthError::Unauthorized(_) => "UNAUTHORIZED",
            AuthError::Forbidden(_) => "FORBIDDEN",
            AuthError::NotFound(_) => "NOT_FOUND",
            AuthError::Conflict(_) => "CONFLICT",
            AuthError::RateLimited { .. } => "RATE_LIMITED",
            AuthError::Database(_) | AuthError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::Validation { .. } => StatusCode::BAD_REQUEST,
            AuthError::InvalidCredentials | AuthError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AuthError::AccountLocked { .. } | AuthError::Forbidden(_) => StatusCode::FORBIDDEN,
            AuthError::NotFound(_) => StatusCode::NOT_FOUND,
            AuthError::Conflict(_) => StatusCode::CONFLICT,
            AuthError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AuthError::Database(_) | AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True when the underlying store rejected a write on a UNIQUE constraint
    pub fn is_unique_violation(&self) -> bool {
        match self {
            AuthError::Database(sqlx::Error::Database(db)) => db.is_unique_violation(),
            _ => false,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

/// Error envelope: `{ success: false, error, timestamp }`
#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    success: bool,
    error: ErrorBody,
    timestamp: DateTime<Utc>,
}

/// Convert AuthError to HTTP response
impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        let (message, details) = match &self {
            AuthError::Validation { message, fields } => {
                let details = (!fields.is_empty()).then(|| serde_json::json!({ "fields": fields }));
                (message.clone(), details)
            }
            AuthError::AccountLocked { locked_until } => (
                "Account is temporarily locked due to repeated failed sign-in attempts".to_string(),
                Some(serde_json::json!({ "lockedUntil": locked_until })),
            ),
            AuthError::RateLimited { retry_after } => (
                "Too many attempts, please try again later".to_string(),
                Some(serde_json::json!({ "retryAfter": retry_after_secs(*retry_after) })),
            ),
            AuthError::Database(e) => {
                tracing::error!(error = %e, "database failure surfaced to client as internal error");
                ("Internal server error".to_string(), None)
            }
            AuthError::Internal(e) => {
                tracing::error!(error = %e, "internal failure");
                ("Internal server error".to_string(), None)
            }
            AuthError::InvalidCredentials => (self.to_string(), None),
            AuthError::Unauthorized(_)
            | AuthError::Forbidden(_)
            | AuthError::NotFound(_)
            | AuthError::Conflict(_) => (self.to_string(), None),
        };

        let body = Json(ErrorEnvelope {
            success: false,
            error: ErrorBody {
                code,
                message,
                details,
            },
            timestamp: Utc::now(),
        });

        let mut response = (status, body).into_response();
        if let AuthError::RateLimited { retry_after } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs(retry_after).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Whole seconds, rounded up, never zero
fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

/// Result type alias for service operations
pub type AuthResult<T> = Result<T, AuthError>;
