/// Token issuer: mints, verifies and rotates tokens
use super::{Claims, TokenError, TokenType};
use crate::{
    config::AuthConfig,
    context::RequestContext,
    crypto::{hash_token, token_fingerprint},
    db::account::{Account, RefreshToken},
    error::{AuthError, AuthResult},
    metrics,
};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use sqlx::SqlitePool;
use uuid::Uuid;

/// The only algorithm accepted; the token header cannot choose another.
const ALGORITHM: Algorithm = Algorithm::HS256;

/// A freshly minted token. The raw value exists only here and in the response.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of applying the rotation policy to a presented refresh token
#[derive(Debug)]
pub enum RefreshOutcome {
    /// Enough lifetime left; the presented token stays in use unchanged
    Reused,
    /// The presented token was revoked and replaced
    Rotated {
        token: IssuedToken,
        record: RefreshToken,
    },
}

/// Token issuer service
pub struct TokenIssuer {
    db: SqlitePool,
    config: AuthConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl TokenIssuer {
    pub fn new(db: SqlitePool, config: AuthConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.jwt_secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.jwt_secret.as_bytes());

        Self {
            db,
            config,
            encoding_key,
            decoding_key,
        }
    }

    pub fn access_ttl(&self) -> Duration {
        Duration::seconds(self.config.access_token_ttl_secs)
    }

    pub fn refresh_ttl(&self) -> Duration {
        Duration::seconds(self.config.refresh_token_ttl_secs)
    }

    /// Clock skew tolerated past `exp` when verifying
    pub fn leeway(&self) -> Duration {
        Duration::seconds(self.config.leeway_secs.min(u32::MAX as u64) as i64)
    }

    fn rotation_threshold(&self) -> Duration {
        Duration::seconds(self.config.refresh_rotation_threshold_secs)
    }

    /// Mint a short-lived access token bound to a session
    pub fn issue_access(&self, account: &Account, session_id: &str) -> AuthResult<IssuedToken> {
        let now = Utc::now();
        let expires_at = now + self.access_ttl();
        let claims = self.claims_for(
            account,
            TokenType::Access,
            Some(session_id.to_string()),
            Uuid::new_v4().to_string(),
            now,
            expires_at,
        );

        let token = self.sign(&claims)?;
        metrics::record_token_issued(TokenType::Access);

        Ok(IssuedToken { token, expires_at })
    }

    /// Mint a refresh token and persist its digest.
    ///
    /// The returned raw token is the only copy; the record holds the hash.
    pub async fn issue_refresh(
        &self,
        account: &Account,
        session_id: Option<&str>,
        meta: &RequestContext,
    ) -> AuthResult<(IssuedToken, RefreshToken)> {
        let (issued, record) = self.build_refresh(account, session_id, meta)?;
        insert_refresh_record(&self.db, &record).await?;

        tracing::debug!(
            account_id = %account.id,
            refresh_token_id = %record.id,
            "Issued refresh token"
        );

        Ok((issued, record))
    }

    /// Verify signature, issuer, expiry and the expected token type
    pub fn verify(&self, token: &str, expected: TokenType) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(ALGORITHM);
        validation.leeway = self.config.leeway_secs;
        validation.set_issuer(&[self.config.jwt_issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        let data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => {
                    tracing::debug!(error = %e, token = %token_fingerprint(token), "Token rejected");
                    TokenError::Malformed
                }
            }
        })?;

        if data.claims.token_type != expected {
            return Err(TokenError::WrongType {
                expected: expected.as_str(),
            });
        }

        Ok(data.claims)
    }

    /// Look up a refresh token record by raw token
    pub async fn find_refresh(&self, raw: &str) -> AuthResult<Option<RefreshToken>> {
        let record = sqlx::query_as::<_, RefreshToken>(
            "SELECT id, account_id, session_id, token_hash, expires_at, revoked, revoked_at,
                    replaced_by, user_agent, ip_address, device_id, created_at
             FROM refresh_token WHERE token_hash = ?1",
        )
        .bind(hash_token(raw))
        .fetch_optional(&self.db)
        .await?;

        Ok(record)
    }

    /// Apply the rotation policy to a valid, unrevoked refresh token record.
    ///
    /// Below the threshold the old record is revoked and a replacement issued
    /// in one transaction. The revoke is conditional on `revoked = 0`, so of two
    /// racing rotations only one can succeed.
    pub async fn rotate_or_reuse(
        &self,
        record: &RefreshToken,
        account: &Account,
        meta: &RequestContext,
    ) -> AuthResult<RefreshOutcome> {
        let remaining = record.expires_at - Utc::now();
        if remaining >= self.rotation_threshold() {
            return Ok(RefreshOutcome::Reused);
        }

        let (issued, new_record) = self.build_refresh(account, record.session_id.as_deref(), meta)?;

        let mut tx = self.db.begin().await?;

        let revoked = sqlx::query(
            "UPDATE refresh_token SET revoked = 1, revoked_at = ?1, replaced_by = ?2
             WHERE id = ?3 AND revoked = 0",
        )
        .bind(Utc::now())
        .bind(&new_record.id)
        .bind(&record.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if revoked == 0 {
            tx.rollback().await?;
            tracing::warn!(
                account_id = %record.account_id,
                refresh_token_id = %record.id,
                "Refresh token was rotated concurrently"
            );
            return Err(AuthError::Unauthorized("Refresh token is no longer valid".to_string()));
        }

        insert_refresh_record(&mut *tx, &new_record).await?;
        tx.commit().await?;

        metrics::record_refresh_rotation();
        tracing::info!(
            account_id = %record.account_id,
            old_refresh_token_id = %record.id,
            new_refresh_token_id = %new_record.id,
            "Rotated refresh token"
        );

        Ok(RefreshOutcome::Rotated {
            token: issued,
            record: new_record,
        })
    }

    /// Point a refresh token at a different session
    pub async fn reattach_session(&self, refresh_token_id: &str, session_id: &str) -> AuthResult<()> {
        sqlx::query("UPDATE refresh_token SET session_id = ?1 WHERE id = ?2")
            .bind(session_id)
            .bind(refresh_token_id)
            .execute(&self.db)
            .await?;

        Ok(())
    }

    /// Revoke one refresh token by raw value. Idempotent.
    pub async fn revoke(&self, raw: &str) -> AuthResult<bool> {
        let result = sqlx::query(
            "UPDATE refresh_token SET revoked = 1, revoked_at = ?1 WHERE token_hash = ?2 AND revoked = 0",
        )
        .bind(Utc::now())
        .bind(hash_token(raw))
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Revoke every live refresh token minted for a session
    pub async fn revoke_for_session(&self, session_id: &str) -> AuthResult<u64> {
        let result = sqlx::query(
            "UPDATE refresh_token SET revoked = 1, revoked_at = ?1 WHERE session_id = ?2 AND revoked = 0",
        )
        .bind(Utc::now())
        .bind(session_id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    /// Revoke every live refresh token of an account
    pub async fn revoke_all_for_account(&self, account_id: &str) -> AuthResult<u64> {
        let result = sqlx::query(
            "UPDATE refresh_token SET revoked = 1, revoked_at = ?1 WHERE account_id = ?2 AND revoked = 0",
        )
        .bind(Utc::now())
        .bind(account_id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    /// Count unrevoked, unexpired refresh tokens
    pub async fn active_refresh_count(&self, account_id: &str) -> AuthResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM refresh_token WHERE account_id = ?1 AND revoked = 0 AND expires_at > ?2",
        )
        .bind(account_id)
        .bind(Utc::now())
        .fetch_one(&self.db)
        .await?;

        Ok(count)
    }

    /// Delete refresh tokens past their expiry
    pub async fn cleanup_expired(&self) -> AuthResult<u64> {
        let result = sqlx::query("DELETE FROM refresh_token WHERE expires_at < ?1")
            .bind(Utc::now())
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected())
    }

    fn build_refresh(
        &self,
        account: &Account,
        session_id: Option<&str>,
        meta: &RequestContext,
    ) -> AuthResult<(IssuedToken, RefreshToken)> {
        let now = Utc::now();
        let expires_at = now + self.refresh_ttl();
        let id = Uuid::new_v4().to_string();

        let claims = self.claims_for(
            account,
            TokenType::Refresh,
            session_id.map(str::to_string),
            id.clone(),
            now,
            expires_at,
        );
        let token = self.sign(&claims)?;
        metrics::record_token_issued(TokenType::Refresh);

        let record = RefreshToken {
            id,
            account_id: account.id.clone(),
            session_id: session_id.map(str::to_string),
            token_hash: hash_token(&token),
            expires_at,
            revoked: false,
            revoked_at: None,
            replaced_by: None,
            user_agent: meta.user_agent.clone(),
            ip_address: meta.ip.clone(),
            device_id: meta.device_id.clone(),
            created_at: now,
        };

        Ok((IssuedToken { token, expires_at }, record))
    }

    fn claims_for(
        &self,
        account: &Account,
        token_type: TokenType,
        sid: Option<String>,
        jti: String,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Claims {
        Claims {
            sub: account.id.clone(),
            email: account.email.clone(),
            username: account.username.clone(),
            role: account.role,
            token_type,
            sid,
            jti,
            iss: self.config.jwt_issuer.clone(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        }
    }

    fn sign(&self, claims: &Claims) -> AuthResult<String> {
        encode(&Header::new(ALGORITHM), claims, &self.encoding_key)
            .map_err(|e| AuthError::Internal(format!("Failed to sign token: {}", e)))
    }
}

async fn insert_refresh_record<'e, E>(executor: E, record: &RefreshToken) -> AuthResult<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "INSERT INTO refresh_token (id, account_id, session_id, token_hash, expires_at, revoked,
                                    user_agent, ip_address, device_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?8, ?9)",
    )
    .bind(&record.id)
    .bind(&record.account_id)
    .bind(&record.session_id)
    .bind(&record.token_hash)
    .bind(record.expires_at)
    .bind(&record.user_agent)
    .bind(&record.ip_address)
    .bind(&record.device_id)
    .bind(record.created_at)
    .execute(executor)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::account::Role;
    use crate::test_support::{insert_account, setup_db, test_config};

    fn issuer(db: SqlitePool) -> TokenIssuer {
        TokenIssuer::new(db, test_config().authentication)
    }

    #[tokio::test]
    async fn test_access_token_round_trip() {
        let db = setup_db().await;
        let account = insert_account(&db, "alice@example.com", "alice", None).await;
        let issuer = issuer(db);

        let issued = issuer.issue_access(&account, "session-1").unwrap();
        let claims = issuer.verify(&issued.token, TokenType::Access).unwrap();

        assert_eq!(claims.sub, account.id);
        assert_eq!(claims.email, "alice@example.com");
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.role, Role::User);
        assert_eq!(claims.sid.as_deref(), Some("session-1"));
        assert_eq!(claims.exp - claims.iat, 15 * 60);
    }

    #[tokio::test]
    async fn test_verify_rejects_wrong_type() {
        let db = setup_db().await;
        let account = insert_account(&db, "bob@example.com", "bob", None).await;
        let issuer = issuer(db);

        let access = issuer.issue_access(&account, "s").unwrap();
        assert_eq!(
            issuer.verify(&access.token, TokenType::Refresh),
            Err(TokenError::WrongType { expected: "refresh" })
        );

        let (refresh, _) = issuer
            .issue_refresh(&account, None, &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(
            issuer.verify(&refresh.token, TokenType::Access),
            Err(TokenError::WrongType { expected: "access" })
        );
    }

    #[tokio::test]
    async fn test_verify_rejects_expired_and_garbage() {
        let db = setup_db().await;
        let account = insert_account(&db, "carol@example.com", "carol", None).await;
        let issuer = issuer(db);

        let past = Utc::now() - Duration::hours(2);
        let claims = issuer.claims_for(
            &account,
            TokenType::Access,
            None,
            "jti".into(),
            past - Duration::minutes(15),
            past,
        );
        let expired = issuer.sign(&claims).unwrap();

        assert_eq!(issuer.verify(&expired, TokenType::Access), Err(TokenError::Expired));
        assert_eq!(issuer.verify("not.a.jwt", TokenType::Access), Err(TokenError::Malformed));
    }

    #[tokio::test]
    async fn test_verify_rejects_foreign_secret_and_algorithm() {
        let db = setup_db().await;
        let account = insert_account(&db, "dave@example.com", "dave", None).await;
        let issuer = issuer(db.clone());

        let mut other_config = test_config().authentication;
        other_config.jwt_secret = "another-secret-that-is-also-long-enough".to_string();
        let other = TokenIssuer::new(db, other_config);
        let forged = other.issue_access(&account, "s").unwrap();
        assert_eq!(issuer.verify(&forged.token, TokenType::Access), Err(TokenError::Malformed));

        // Same secret, different algorithm in the header.
        let claims = issuer.claims_for(
            &account,
            TokenType::Access,
            None,
            "jti".into(),
            Utc::now(),
            Utc::now() + Duration::minutes(5),
        );
        let hs512 = encode(&Header::new(Algorithm::HS512), &claims, &issuer.encoding_key).unwrap();
        assert_eq!(issuer.verify(&hs512, TokenType::Access), Err(TokenError::Malformed));
    }

    #[tokio::test]
    async fn test_refresh_record_stores_hash_only() {
        let db = setup_db().await;
        let account = insert_account(&db, "erin@example.com", "erin", None).await;
        let issuer = issuer(db.clone());

        let meta = RequestContext {
            ip: Some("10.0.0.1".into()),
            user_agent: Some("test-agent".into()),
            device_id: Some("device-1".into()),
        };
        let (issued, record) = issuer.issue_refresh(&account, None, &meta).await.unwrap();

        let stored: String = sqlx::query_scalar("SELECT token_hash FROM refresh_token WHERE id = ?1")
            .bind(&record.id)
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(stored, hash_token(&issued.token));
        assert_ne!(stored, issued.token);

        let found = issuer.find_refresh(&issued.token).await.unwrap().unwrap();
        assert_eq!(found.id, record.id);
        assert_eq!(found.device_id.as_deref(), Some("device-1"));
        assert_eq!(issuer.active_refresh_count(&account.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fresh_token_is_reused_without_writes() {
        let db = setup_db().await;
        let account = insert_account(&db, "fay@example.com", "fay", None).await;
        let issuer = issuer(db.clone());

        let (_, record) = issuer
            .issue_refresh(&account, None, &RequestContext::default())
            .await
            .unwrap();

        let outcome = issuer
            .rotate_or_reuse(&record, &account, &RequestContext::default())
            .await
            .unwrap();
        assert!(matches!(outcome, RefreshOutcome::Reused));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM refresh_token")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_rotation_is_exactly_once() {
        let db = setup_db().await;
        let account = insert_account(&db, "gus@example.com", "gus", None).await;
        let issuer = issuer(db.clone());

        let (old, mut record) = issuer
            .issue_refresh(&account, None, &RequestContext::default())
            .await
            .unwrap();

        // Pull the record inside the rotation window.
        record.expires_at = Utc::now() + Duration::minutes(30);
        sqlx::query("UPDATE refresh_token SET expires_at = ?1 WHERE id = ?2")
            .bind(record.expires_at)
            .bind(&record.id)
            .execute(&db)
            .await
            .unwrap();

        let first = issuer
            .rotate_or_reuse(&record, &account, &RequestContext::default())
            .await
            .unwrap();
        let new_token = match first {
            RefreshOutcome::Rotated { token, record: new_record } => {
                assert_ne!(new_record.id, record.id);
                token
            }
            RefreshOutcome::Reused => panic!("expected rotation"),
        };

        // A second rotation of the same stale record loses the race.
        let second = issuer
            .rotate_or_reuse(&record, &account, &RequestContext::default())
            .await;
        assert!(matches!(second, Err(AuthError::Unauthorized(_))));

        let old_record = issuer.find_refresh(&old.token).await.unwrap().unwrap();
        assert!(old_record.revoked);
        let new_record = issuer.find_refresh(&new_token.token).await.unwrap().unwrap();
        assert!(!new_record.revoked);
        assert_eq!(old_record.replaced_by.as_deref(), Some(new_record.id.as_str()));
        assert_eq!(issuer.active_refresh_count(&account.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_revoke_all_and_cleanup() {
        let db = setup_db().await;
        let account = insert_account(&db, "hal@example.com", "hal", None).await;
        let issuer = issuer(db.clone());

        for _ in 0..3 {
            issuer
                .issue_refresh(&account, None, &RequestContext::default())
                .await
                .unwrap();
        }
        assert_eq!(issuer.revoke_all_for_account(&account.id).await.unwrap(), 3);
        assert_eq!(issuer.revoke_all_for_account(&account.id).await.unwrap(), 0);
        assert_eq!(issuer.active_refresh_count(&account.id).await.unwrap(), 0);

        sqlx::query("UPDATE refresh_token SET expires_at = ?1")
            .bind(Utc::now() - Duration::days(1))
            .execute(&db)
            .await
            .unwrap();
        assert_eq!(issuer.cleanup_expired().await.unwrap(), 3);
    }
}
