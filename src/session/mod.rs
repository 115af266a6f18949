/// Session store
///
/// Owns session rows and the flows that span sessions, tokens and the
/// revocation ledger: sign-in, per-request authorization, token renewal,
/// sign-out and bulk invalidation. Every check re-reads the store; nothing
/// about a session is cached between requests.
use crate::{
    account::{AccountManager, LockState, LockoutPolicy},
    config::AuthConfig,
    context::RequestContext,
    crypto::{generate_secure_token, hash_token},
    db::account::{Account, Session},
    error::{AuthError, AuthResult},
    metrics,
    revocation::{RevocationLedger, RevocationReason},
    token::{Claims, IssuedToken, RefreshOutcome, TokenIssuer, TokenType},
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

/// Sessions idle this long have their last-activity stamp refreshed
const TOUCH_INTERVAL_SECS: i64 = 60;
/// Invalidated sessions are kept this long for auditing
const INACTIVE_RETENTION_DAYS: i64 = 7;

const INVALID_TOKEN: &str = "Invalid or expired authentication token";
const INVALID_REFRESH: &str = "Invalid or expired refresh token";

/// Everything a fresh sign-in hands back to the client
#[derive(Debug, Clone)]
pub struct SessionBundle {
    pub session: Session,
    /// Raw opaque session token; only its hash is stored
    pub session_token: String,
    pub csrf_token: String,
    pub access: IssuedToken,
    pub refresh: Option<IssuedToken>,
}

/// A request that passed authorization
#[derive(Debug, Clone)]
pub struct AuthorizedSession {
    pub claims: Claims,
    pub session: Session,
    pub account: Account,
    pub access_token: String,
}

/// Result of exchanging a refresh token
#[derive(Debug, Clone)]
pub struct RenewedTokens {
    pub account: Account,
    pub session_id: String,
    pub access: IssuedToken,
    pub refresh: IssuedToken,
    pub rotated: bool,
    /// Set when the original session had disappeared and a new one was opened
    pub new_session: Option<(String, String)>,
}

/// Introspection counters for one account
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub active_session_count: i64,
    pub active_refresh_token_count: i64,
    pub passkey_count: i64,
    pub login_count: i64,
    pub last_login_at: Option<DateTime<Utc>>,
}

/// Session store service
pub struct SessionStore {
    db: SqlitePool,
    config: AuthConfig,
    tokens: Arc<TokenIssuer>,
    ledger: Arc<RevocationLedger>,
    accounts: Arc<AccountManager>,
}

impl SessionStore {
    pub fn new(
        db: SqlitePool,
        config: AuthConfig,
        tokens: Arc<TokenIssuer>,
        ledger: Arc<RevocationLedger>,
        accounts: Arc<AccountManager>,
    ) -> Self {
        Self {
            db,
            config,
            tokens,
            ledger,
            accounts,
        }
    }

    fn ttl(&self, remember_me: bool) -> Duration {
        if remember_me {
            Duration::seconds(self.config.refresh_token_ttl_secs)
        } else {
            Duration::seconds(self.config.session_ttl_secs)
        }
    }

    /// Open a session and mint its tokens. Used by login and registration.
    pub async fn create(
        &self,
        account: &Account,
        meta: &RequestContext,
        remember_me: bool,
    ) -> AuthResult<SessionBundle> {
        let (session, session_token) = self.insert_session(account, meta, remember_me).await?;

        let access = self.tokens.issue_access(account, &session.id)?;
        let refresh = if remember_me {
            let (issued, _) = self
                .tokens
                .issue_refresh(account, Some(&session.id), meta)
                .await?;
            Some(issued)
        } else {
            None
        };

        tracing::info!(
            account_id = %account.id,
            session_id = %session.id,
            remember_me,
            "Session created"
        );

        Ok(SessionBundle {
            csrf_token: session.csrf_token.clone(),
            session,
            session_token,
            access,
            refresh,
        })
    }

    async fn insert_session(
        &self,
        account: &Account,
        meta: &RequestContext,
        remember_me: bool,
    ) -> AuthResult<(Session, String)> {
        let now = Utc::now();
        let session_token = generate_secure_token();

        let session = Session {
            id: Uuid::new_v4().to_string(),
            account_id: account.id.clone(),
            token_hash: hash_token(&session_token),
            csrf_token: generate_secure_token(),
            remember_me,
            is_active: true,
            user_agent: meta.user_agent.clone(),
            ip_address: meta.ip.clone(),
            device_id: meta.device_id.clone(),
            created_at: now,
            last_activity_at: now,
            expires_at: now + self.ttl(remember_me),
            invalidated_at: None,
        };

        sqlx::query(
            "INSERT INTO session (id, account_id, token_hash, csrf_token, remember_me, is_active,
                                  user_agent, ip_address, device_id, created_at, last_activity_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7, ?8, ?9, ?9, ?10)",
        )
        .bind(&session.id)
        .bind(&session.account_id)
        .bind(&session.token_hash)
        .bind(&session.csrf_token)
        .bind(session.remember_me)
        .bind(&session.user_agent)
        .bind(&session.ip_address)
        .bind(&session.device_id)
        .bind(now)
        .bind(session.expires_at)
        .execute(&self.db)
        .await?;

        Ok((session, session_token))
    }

    /// Get a session by id, active or not
    pub async fn find(&self, session_id: &str) -> AuthResult<Option<Session>> {
        let session = sqlx::query_as::<_, Session>("SELECT * FROM session WHERE id = ?1")
            .bind(session_id)
            .fetch_optional(&self.db)
            .await?;

        Ok(session)
    }

    /// Invalidate the session identified by its raw session token. Idempotent.
    pub async fn invalidate(&self, session_token: &str) -> AuthResult<bool> {
        let session_id: Option<String> =
            sqlx::query_scalar("SELECT id FROM session WHERE token_hash = ?1")
                .bind(hash_token(session_token))
                .fetch_optional(&self.db)
                .await?;

        match session_id {
            Some(id) => self.invalidate_session(&id).await,
            None => Ok(false),
        }
    }

    /// Invalidate one session and revoke the refresh tokens minted for it
    pub async fn invalidate_session(&self, session_id: &str) -> AuthResult<bool> {
        let result = sqlx::query(
            "UPDATE session SET is_active = 0, invalidated_at = ?1 WHERE id = ?2 AND is_active = 1",
        )
        .bind(Utc::now())
        .bind(session_id)
        .execute(&self.db)
        .await?;

        let revoked = self.tokens.revoke_for_session(session_id).await?;
        let invalidated = result.rows_affected() > 0;

        if invalidated {
            tracing::info!(session_id, revoked_refresh_tokens = revoked, "Session invalidated");
        }

        Ok(invalidated)
    }

    /// Invalidate every session and revoke every refresh token of an account
    pub async fn invalidate_all(&self, account_id: &str) -> AuthResult<u64> {
        let result = sqlx::query(
            "UPDATE session SET is_active = 0, invalidated_at = ?1 WHERE account_id = ?2 AND is_active = 1",
        )
        .bind(Utc::now())
        .bind(account_id)
        .execute(&self.db)
        .await?;

        let revoked = self.tokens.revoke_all_for_account(account_id).await?;

        tracing::info!(
            account_id,
            sessions = result.rows_affected(),
            revoked_refresh_tokens = revoked,
            "All sessions invalidated"
        );

        Ok(result.rows_affected())
    }

    /// Extend an active session's expiry.
    ///
    /// A missing or inactive session is logged and reported as `None` rather
    /// than an error.
    pub async fn refresh(&self, session_id: &str) -> AuthResult<Option<Session>> {
        let Some(session) = self.find(session_id).await? else {
            tracing::warn!(session_id, "Session to refresh no longer exists");
            return Ok(None);
        };

        if !session.is_active {
            tracing::warn!(session_id, "Session to refresh is no longer active");
            return Ok(None);
        }

        let now = Utc::now();
        let expires_at = now + self.ttl(session.remember_me);
        sqlx::query("UPDATE session SET expires_at = ?1, last_activity_at = ?2 WHERE id = ?3")
            .bind(expires_at)
            .bind(now)
            .bind(session_id)
            .execute(&self.db)
            .await?;

        Ok(Some(Session {
            expires_at,
            last_activity_at: now,
            ..session
        }))
    }

    /// Load an active, unexpired session owned by `account_id`
    pub async fn validate(&self, session_id: &str, account_id: &str) -> AuthResult<Session> {
        sqlx::query_as::<_, Session>(
            "SELECT * FROM session
             WHERE id = ?1 AND account_id = ?2 AND is_active = 1 AND expires_at > ?3",
        )
        .bind(session_id)
        .bind(account_id)
        .bind(Utc::now())
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AuthError::Unauthorized(INVALID_TOKEN.to_string()))
    }

    /// Authorize a request carrying an access token.
    ///
    /// Signature, expiry and type, then the revocation ledger, then the
    /// session, then the account as currently stored. Every failure looks
    /// the same to the caller.
    pub async fn authorize(&self, access_token: &str) -> AuthResult<AuthorizedSession> {
        let claims = self
            .tokens
            .verify(access_token, TokenType::Access)
            .map_err(|e| {
                tracing::debug!(error = %e, "Access token rejected");
                AuthError::Unauthorized(INVALID_TOKEN.to_string())
            })?;

        if self.ledger.is_blacklisted(access_token).await? {
            tracing::debug!(account_id = %claims.sub, "Blacklisted access token presented");
            return Err(AuthError::Unauthorized(INVALID_TOKEN.to_string()));
        }

        let session_id = claims
            .sid
            .as_deref()
            .ok_or_else(|| AuthError::Unauthorized(INVALID_TOKEN.to_string()))?;
        let mut session = self.validate(session_id, &claims.sub).await?;

        let account = match self.accounts.get_account(&claims.sub).await {
            Ok(account) => account,
            Err(AuthError::NotFound(_)) => {
                return Err(AuthError::Unauthorized(INVALID_TOKEN.to_string()))
            }
            Err(e) => return Err(e),
        };

        if let LockState::Locked(_) = LockoutPolicy::evaluate(&account, Utc::now()) {
            return Err(AuthError::Unauthorized(INVALID_TOKEN.to_string()));
        }

        let now = Utc::now();
        if now - session.last_activity_at > Duration::seconds(TOUCH_INTERVAL_SECS) {
            sqlx::query("UPDATE session SET last_activity_at = ?1 WHERE id = ?2")
                .bind(now)
                .bind(&session.id)
                .execute(&self.db)
                .await?;
            session.last_activity_at = now;
        }

        Ok(AuthorizedSession {
            claims,
            session,
            account,
            access_token: access_token.to_string(),
        })
    }

    /// Exchange a refresh token for a new access token, rotating the
    /// refresh token when it is close to expiry.
    pub async fn renew(&self, raw_refresh: &str, meta: &RequestContext) -> AuthResult<RenewedTokens> {
        let claims = self
            .tokens
            .verify(raw_refresh, TokenType::Refresh)
            .map_err(|e| {
                tracing::debug!(error = %e, "Refresh token rejected");
                AuthError::Unauthorized(INVALID_REFRESH.to_string())
            })?;

        if self.ledger.is_blacklisted(raw_refresh).await? {
            return Err(AuthError::Unauthorized(INVALID_REFRESH.to_string()));
        }

        let Some(mut record) = self.tokens.find_refresh(raw_refresh).await? else {
            return Err(AuthError::Unauthorized(INVALID_REFRESH.to_string()));
        };

        if record.revoked {
            tracing::warn!(
                account_id = %record.account_id,
                refresh_token_id = %record.id,
                "Revoked refresh token presented"
            );
            return Err(AuthError::Unauthorized(INVALID_REFRESH.to_string()));
        }

        if record.expires_at <= Utc::now()
            || record.account_id != claims.sub
            || record.id != claims.jti
        {
            return Err(AuthError::Unauthorized(INVALID_REFRESH.to_string()));
        }

        let account = match self.accounts.get_account(&record.account_id).await {
            Ok(account) => account,
            Err(AuthError::NotFound(_)) => {
                return Err(AuthError::Unauthorized(INVALID_REFRESH.to_string()))
            }
            Err(e) => return Err(e),
        };

        if let LockState::Locked(locked_until) = LockoutPolicy::evaluate(&account, Utc::now()) {
            return Err(AuthError::AccountLocked { locked_until });
        }

        // Keep the session alive; if it vanished, anchor the token to a new one.
        let existing = match record.session_id.as_deref() {
            Some(id) => self.find(id).await?,
            None => None,
        };

        let (session_id, new_session) = match existing {
            Some(session) if !session.is_active => {
                return Err(AuthError::Unauthorized(INVALID_REFRESH.to_string()));
            }
            Some(session) => {
                self.refresh(&session.id).await?;
                (session.id, None)
            }
            None => {
                let (session, session_token) = self.insert_session(&account, meta, true).await?;
                self.tokens.reattach_session(&record.id, &session.id).await?;
                record.session_id = Some(session.id.clone());
                tracing::info!(
                    account_id = %account.id,
                    session_id = %session.id,
                    "Re-anchored refresh token to a new session"
                );
                (session.id, Some((session_token, session.csrf_token)))
            }
        };

        let (refresh, rotated) = match self.tokens.rotate_or_reuse(&record, &account, meta).await? {
            RefreshOutcome::Reused => {
                metrics::record_refresh_reuse();
                (
                    IssuedToken {
                        token: raw_refresh.to_string(),
                        expires_at: record.expires_at,
                    },
                    false,
                )
            }
            RefreshOutcome::Rotated { token, .. } => (token, true),
        };

        let access = self.tokens.issue_access(&account, &session_id)?;

        Ok(RenewedTokens {
            account,
            session_id,
            access,
            refresh,
            rotated,
            new_session,
        })
    }

    /// Sign out the authorized session, or every session of its account.
    ///
    /// The presented access token is blacklisted until its natural expiry.
    pub async fn sign_out(
        &self,
        auth: &AuthorizedSession,
        logout_all: bool,
        refresh_token: Option<&str>,
    ) -> AuthResult<()> {
        let reason = if logout_all {
            RevocationReason::LogoutAll
        } else {
            RevocationReason::Logout
        };

        self.blacklist_access(auth, reason).await?;

        if logout_all {
            self.invalidate_all(&auth.account.id).await?;
        } else {
            self.invalidate_session(&auth.session.id).await?;
        }

        if let Some(raw) = refresh_token {
            self.tokens.revoke(raw).await?;
        }

        Ok(())
    }

    /// Blacklist the access token an authorized request was made with.
    ///
    /// The entry outlives `exp` by the verification leeway, since the token
    /// still verifies until then.
    pub async fn blacklist_access(
        &self,
        auth: &AuthorizedSession,
        reason: RevocationReason,
    ) -> AuthResult<()> {
        let expires_at = DateTime::from_timestamp(auth.claims.exp, 0)
            .unwrap_or_else(|| Utc::now() + self.tokens.access_ttl())
            + self.tokens.leeway();

        self.ledger
            .blacklist(&auth.access_token, &auth.account.id, reason, expires_at)
            .await
    }

    /// Active, unexpired sessions of an account, newest first
    pub async fn list_active(&self, account_id: &str) -> AuthResult<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(
            "SELECT * FROM session
             WHERE account_id = ?1 AND is_active = 1 AND expires_at > ?2
             ORDER BY created_at DESC",
        )
        .bind(account_id)
        .bind(Utc::now())
        .fetch_all(&self.db)
        .await?;

        Ok(sessions)
    }

    /// Introspection counters for an account
    pub async fn stats(&self, account_id: &str) -> AuthResult<SessionStats> {
        let account = self.accounts.get_account(account_id).await?;

        let active_session_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM session WHERE account_id = ?1 AND is_active = 1 AND expires_at > ?2",
        )
        .bind(account_id)
        .bind(Utc::now())
        .fetch_one(&self.db)
        .await?;

        Ok(SessionStats {
            active_session_count,
            active_refresh_token_count: self.tokens.active_refresh_count(account_id).await?,
            passkey_count: self.accounts.passkey_count(account_id).await?,
            login_count: account.login_count,
            last_login_at: account.last_login_at,
        })
    }

    /// Delete expired sessions and invalidated sessions past retention
    pub async fn cleanup_expired(&self) -> AuthResult<u64> {
        let now = Utc::now();
        let result = sqlx::query(
            "DELETE FROM session
             WHERE expires_at < ?1 OR (is_active = 0 AND invalidated_at < ?2)",
        )
        .bind(now)
        .bind(now - Duration::days(INACTIVE_RETENTION_DAYS))
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }
}
