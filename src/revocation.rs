/// Revocation ledger
///
/// Append-only blacklist of token digests. An entry only matters until the
/// token it names would have expired anyway, after which cleanup may drop it.
use crate::{
    crypto::{hash_token, token_fingerprint},
    error::AuthResult,
    metrics,
};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

/// Why a token was blacklisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationReason {
    Logout,
    LogoutAll,
    PasswordChange,
    AdminForcedLogout,
}

impl RevocationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevocationReason::Logout => "logout",
            RevocationReason::LogoutAll => "logout_all",
            RevocationReason::PasswordChange => "password_change",
            RevocationReason::AdminForcedLogout => "admin_forced_logout",
        }
    }
}

/// Revocation ledger service
pub struct RevocationLedger {
    db: SqlitePool,
}

impl RevocationLedger {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Blacklist a token until its natural expiry. Idempotent.
    pub async fn blacklist(
        &self,
        token: &str,
        account_id: &str,
        reason: RevocationReason,
        expires_at: DateTime<Utc>,
    ) -> AuthResult<()> {
        let inserted = sqlx::query(
            "INSERT INTO revocation_entry (id, token_hash, account_id, reason, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(token_hash) DO NOTHING",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(hash_token(token))
        .bind(account_id)
        .bind(reason.as_str())
        .bind(expires_at)
        .bind(Utc::now())
        .execute(&self.db)
        .await?
        .rows_affected();

        if inserted > 0 {
            metrics::record_revocation(reason.as_str());
            tracing::info!(
                account_id,
                reason = reason.as_str(),
                token = %token_fingerprint(token),
                "Token blacklisted"
            );
        }

        Ok(())
    }

    /// Whether the token has been blacklisted
    pub async fn is_blacklisted(&self, token: &str) -> AuthResult<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM revocation_entry WHERE token_hash = ?1")
                .bind(hash_token(token))
                .fetch_one(&self.db)
                .await?;

        Ok(count > 0)
    }

    /// Drop entries whose token has expired on its own
    pub async fn cleanup_expired(&self) -> AuthResult<u64> {
        let result = sqlx::query("DELETE FROM revocation_entry WHERE expires_at < ?1")
            .bind(Utc::now())
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected())
    }
}
