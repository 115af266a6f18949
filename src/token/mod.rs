/// Token issuance and verification
///
/// Access and refresh tokens are both HS256 JWTs distinguished by the
/// `tokenType` claim. Access tokens are never persisted; refresh tokens are
/// persisted by digest only.

mod issuer;

pub use issuer::{IssuedToken, RefreshOutcome, TokenIssuer};

use crate::db::account::Role;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which kind of credential a JWT represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
        }
    }
}

/// JWT claims shared by access and refresh tokens
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    /// Account id
    pub sub: String,
    pub email: String,
    pub username: String,
    pub role: Role,
    pub token_type: TokenType,
    /// Session the token was minted for
    pub sid: Option<String>,
    /// Unique token id; for refresh tokens this is the record id
    pub jti: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

/// Reasons a token fails verification.
///
/// Kept internal: the HTTP layer collapses all of these into one
/// `Unauthorized` so callers cannot probe which check failed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token has expired")]
    Expired,
    #[error("token is malformed or has an invalid signature")]
    Malformed,
    #[error("expected a {expected} token")]
    WrongType { expected: &'static str },
}
