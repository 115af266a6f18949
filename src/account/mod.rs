/// Account management system
///
/// Handles account creation, credential verification, lockout and the
/// request/response bodies of the account-facing endpoints.

mod lockout;
mod manager;
mod verifier;

pub use lockout::{LockState, LockoutPolicy};
pub use manager::AccountManager;
pub use verifier::CredentialVerifier;

use crate::{
    db::account::{Account, Role, Session},
    error::FieldError,
    token::IssuedToken,
    validation::{
        confirmation_mismatch, validate_accept_terms, validate_password_strength,
        validate_username, RequestRules,
    },
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Registration request
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[validate(email(message = "Invalid email address"), length(max = 254, message = "Email is too long"))]
    pub email: String,
    #[validate(custom(function = "validate_username"))]
    pub username: String,
    #[validate(custom(function = "validate_password_strength"))]
    pub password: String,
    pub confirm_password: String,
    #[serde(default)]
    #[validate(custom(function = "validate_accept_terms"))]
    pub accept_terms: bool,
}

impl RequestRules for RegisterRequest {
    fn cross_field(&self) -> Vec<FieldError> {
        confirmation_mismatch(&self.password, &self.confirm_password, "confirmPassword")
            .into_iter()
            .collect()
    }
}

/// Device details a client may volunteer at login
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: Option<String>,
    pub name: Option<String>,
}

/// Login request
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    #[validate(email(message = "Invalid email address"))]
    pub email: String,
    #[validate(length(min = 1, max = 128, message = "Password is required"))]
    pub password: String,
    #[serde(default)]
    pub remember_me: bool,
    pub device_info: Option<DeviceInfo>,
}

impl RequestRules for LoginRequest {}

/// Token refresh request; the token may also arrive as a cookie
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    #[validate(length(min = 1, message = "Refresh token must not be empty"))]
    pub refresh_token: Option<String>,
}

impl RequestRules for RefreshRequest {}

/// Logout request
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct LogoutRequest {
    #[serde(default)]
    pub logout_all: bool,
    #[validate(length(max = 200, message = "Reason is too long"))]
    pub reason: Option<String>,
    pub refresh_token: Option<String>,
}

impl RequestRules for LogoutRequest {}

/// Password change request
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    #[validate(length(min = 1, max = 128, message = "Current password is required"))]
    pub current_password: String,
    #[validate(custom(function = "validate_password_strength"))]
    pub new_password: String,
    pub confirm_password: String,
}

impl RequestRules for ChangePasswordRequest {
    fn cross_field(&self) -> Vec<FieldError> {
        let mut errors: Vec<FieldError> =
            confirmation_mismatch(&self.new_password, &self.confirm_password, "confirmPassword")
                .into_iter()
                .collect();
        if !self.current_password.is_empty() && self.current_password == self.new_password {
            errors.push(FieldError {
                field: "newPassword".to_string(),
                message: "New password must differ from the current password".to_string(),
            });
        }
        errors
    }
}

/// Profile update request
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpdateProfileRequest {
    #[validate(custom(function = "validate_username"))]
    pub username: String,
}

impl RequestRules for UpdateProfileRequest {}

/// Admin lock request; no duration locks until an admin unlocks
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct LockAccountRequest {
    #[validate(range(min = 1, max = 525600, message = "Duration must be between 1 minute and 1 year"))]
    pub duration_minutes: Option<i64>,
    #[validate(length(max = 200, message = "Reason is too long"))]
    pub reason: Option<String>,
}

impl RequestRules for LockAccountRequest {}

/// Admin role change request
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpdateRoleRequest {
    pub role: Role,
}

impl RequestRules for UpdateRoleRequest {}

/// Client-facing account view. Never carries the password hash.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub username: String,
    pub role: Role,
    pub is_locked: bool,
    pub locked_until: Option<DateTime<Utc>>,
    pub has_password: bool,
    pub login_count: i64,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<&Account> for UserProfile {
    fn from(account: &Account) -> Self {
        Self {
            id: account.id.clone(),
            email: account.email.clone(),
            username: account.username.clone(),
            role: account.role,
            is_locked: account.is_locked,
            locked_until: account.locked_until,
            has_password: account.password_hash.is_some(),
            login_count: account.login_count,
            last_login_at: account.last_login_at,
            created_at: account.created_at,
        }
    }
}

/// Session info returned to the client
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub expires_at: DateTime<Utc>,
    pub remember_me: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub device_id: Option<String>,
}

impl From<&Session> for SessionInfo {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            expires_at: session.expires_at,
            remember_me: session.remember_me,
            created_at: session.created_at,
            last_activity_at: session.last_activity_at,
            user_agent: session.user_agent.clone(),
            ip_address: session.ip_address.clone(),
            device_id: session.device_id.clone(),
        }
    }
}

/// Bearer token pair
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub token_type: &'static str,
    pub access_token: String,
    pub access_token_expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token_expires_at: Option<DateTime<Utc>>,
}

impl TokenPair {
    pub fn new(access: &IssuedToken, refresh: Option<&IssuedToken>) -> Self {
        Self {
            token_type: "Bearer",
            access_token: access.token.clone(),
            access_token_expires_at: access.expires_at,
            refresh_token: refresh.map(|r| r.token.clone()),
            refresh_token_expires_at: refresh.map(|r| r.expires_at),
        }
    }
}

/// Login / registration response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub user: UserProfile,
    pub session: SessionInfo,
    pub tokens: TokenPair,
    pub csrf_token: String,
}
