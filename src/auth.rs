/// Authentication extractors and utilities
use crate::{
    api::cookies::{read_cookie, AUTH_COOKIE},
    context::AppContext,
    db::account::Role,
    error::AuthError,
    session::AuthorizedSession,
};
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, Method},
};

pub const CSRF_HEADER: &str = "x-csrf-token";

/// Where the access token came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Bearer,
    Cookie,
}

/// Extract bearer token from Authorization header. The scheme is
/// case-insensitive.
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("authorization")?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();

    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_string())
}

/// Access token from the Authorization header, else the auth cookie
pub fn extract_access_token(headers: &HeaderMap) -> Option<(String, TokenSource)> {
    extract_bearer_token(headers)
        .map(|t| (t, TokenSource::Bearer))
        .or_else(|| read_cookie(headers, AUTH_COOKIE).map(|t| (t, TokenSource::Cookie)))
}

fn is_safe_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Cookie-authenticated mutations must echo the session's CSRF token
fn check_csrf(parts: &Parts, source: TokenSource, auth: &AuthorizedSession) -> Result<(), AuthError> {
    if source == TokenSource::Bearer || is_safe_method(&parts.method) {
        return Ok(());
    }

    let presented = parts
        .headers
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if constant_time_eq(presented.as_bytes(), auth.session.csrf_token.as_bytes()) {
        Ok(())
    } else {
        tracing::warn!(session_id = %auth.session.id, "CSRF token missing or mismatched");
        Err(AuthError::Forbidden("Invalid CSRF token".to_string()))
    }
}

/// Authenticated context - extracts and validates session from request
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub auth: AuthorizedSession,
    pub source: TokenSource,
}

#[async_trait]
impl FromRequestParts<AppContext> for AuthContext {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let (token, source) = extract_access_token(&parts.headers)
            .ok_or_else(|| AuthError::Unauthorized("Authentication required".to_string()))?;

        let auth = state.sessions.authorize(&token).await?;
        check_csrf(parts, source, &auth)?;

        Ok(AuthContext { auth, source })
    }
}

/// Admin context - requires the account's stored role to be admin
#[derive(Debug, Clone)]
pub struct AdminAuthContext {
    pub auth: AuthorizedSession,
}

#[async_trait]
impl FromRequestParts<AppContext> for AdminAuthContext {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let AuthContext { auth, .. } = AuthContext::from_request_parts(parts, state).await?;

        if auth.account.role != Role::Admin {
            tracing::warn!(account_id = %auth.account.id, "Non-admin attempted admin operation");
            return Err(AuthError::Forbidden("Admin role required".to_string()));
        }

        Ok(AdminAuthContext { auth })
    }
}
