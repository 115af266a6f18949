/// Credential verifier
///
/// Checks email/password pairs, enforces the lockout policy and writes the
/// login attempt audit trail. Unknown accounts and wrong passwords produce
/// the same error and cost the same bcrypt work.
use super::lockout::{LockState, LockoutPolicy};
use crate::{
    context::RequestContext,
    crypto::password::PasswordHasher,
    db::account::Account,
    error::{AuthError, AuthResult},
    metrics::{self, LoginOutcome},
    validation::normalize_email,
};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

const REASON_UNKNOWN_ACCOUNT: &str = "unknown_account";
const REASON_INVALID_PASSWORD: &str = "invalid_password";
const REASON_ACCOUNT_LOCKED: &str = "account_locked";

pub struct CredentialVerifier {
    db: SqlitePool,
    hasher: PasswordHasher,
    policy: LockoutPolicy,
}

impl CredentialVerifier {
    pub fn new(db: SqlitePool, hasher: PasswordHasher, policy: LockoutPolicy) -> Self {
        Self { db, hasher, policy }
    }

    /// Verify credentials and return the account on success
    pub async fn verify(
        &self,
        email: &str,
        password: &str,
        meta: &RequestContext,
    ) -> AuthResult<Account> {
        let email = normalize_email(email);

        let Some(mut account) = self.find_by_email(&email).await? else {
            // Same bcrypt cost as a real comparison.
            self.hasher.verify(password, None).await?;
            self.record_attempt(None, &email, meta, false, Some(REASON_UNKNOWN_ACCOUNT))
                .await?;
            metrics::record_login(LoginOutcome::InvalidCredentials);
            return Err(AuthError::InvalidCredentials);
        };

        let now = Utc::now();
        match LockoutPolicy::evaluate(&account, now) {
            LockState::Locked(locked_until) => {
                self.record_attempt(
                    Some(&account.id),
                    &email,
                    meta,
                    false,
                    Some(REASON_ACCOUNT_LOCKED),
                )
                .await?;
                metrics::record_login(LoginOutcome::Locked);
                return Err(AuthError::AccountLocked { locked_until });
            }
            LockState::Expired => {
                self.unlock_expired(&account.id, now).await?;
                account.is_locked = false;
                account.locked_until = None;
                account.failed_login_count = 0;
                account.last_failed_login_at = None;
                tracing::info!(account_id = %account.id, "Lock expired; account unlocked on sign-in attempt");
            }
            LockState::Unlocked => {}
        }

        let valid = self
            .hasher
            .verify(password, account.password_hash.as_deref())
            .await?;

        if !valid {
            return Err(self.register_failure(&account, &email, meta).await?);
        }

        self.record_success(&mut account, &email, meta).await?;
        metrics::record_login(LoginOutcome::Success);

        Ok(account)
    }

    /// Count a failed attempt and lock the account if the threshold is reached.
    ///
    /// Returns the error to surface to the caller.
    async fn register_failure(
        &self,
        account: &Account,
        email: &str,
        meta: &RequestContext,
    ) -> AuthResult<AuthError> {
        let now = Utc::now();
        let window_start = self.policy.window_start(now);

        // Single statement so concurrent failures cannot lose increments.
        let failed_count: i64 = sqlx::query_scalar(
            "UPDATE account
             SET failed_login_count = CASE
                     WHEN last_failed_login_at IS NULL OR last_failed_login_at < ?1 THEN 1
                     ELSE failed_login_count + 1
                 END,
                 last_failed_login_at = ?2,
                 updated_at = ?2
             WHERE id = ?3
             RETURNING failed_login_count",
        )
        .bind(window_start)
        .bind(now)
        .bind(&account.id)
        .fetch_one(&self.db)
        .await?;

        self.record_attempt(
            Some(&account.id),
            email,
            meta,
            false,
            Some(REASON_INVALID_PASSWORD),
        )
        .await?;

        if self.policy.should_lock(failed_count) {
            let locked_until = self.policy.lock_until(now);
            sqlx::query(
                "UPDATE account SET is_locked = 1, locked_until = ?1, updated_at = ?2 WHERE id = ?3",
            )
            .bind(locked_until)
            .bind(now)
            .bind(&account.id)
            .execute(&self.db)
            .await?;

            metrics::record_lockout();
            metrics::record_login(LoginOutcome::Locked);
            tracing::warn!(
                account_id = %account.id,
                failed_count,
                locked_until = %locked_until,
                ip = meta.ip.as_deref().unwrap_or("unknown"),
                "Account locked after repeated failed sign-in attempts"
            );

            return Ok(AuthError::AccountLocked {
                locked_until: Some(locked_until),
            });
        }

        metrics::record_login(LoginOutcome::InvalidCredentials);
        tracing::debug!(account_id = %account.id, failed_count, "Failed sign-in attempt");

        Ok(AuthError::InvalidCredentials)
    }

    async fn record_success(
        &self,
        account: &mut Account,
        email: &str,
        meta: &RequestContext,
    ) -> AuthResult<()> {
        let now = Utc::now();

        self.record_attempt(Some(&account.id), email, meta, true, None)
            .await?;

        let login_count: i64 = sqlx::query_scalar(
            "UPDATE account
             SET failed_login_count = 0,
                 last_failed_login_at = NULL,
                 login_count = login_count + 1,
                 last_login_at = ?1,
                 updated_at = ?1
             WHERE id = ?2
             RETURNING login_count",
        )
        .bind(now)
        .bind(&account.id)
        .fetch_one(&self.db)
        .await?;

        account.failed_login_count = 0;
        account.last_failed_login_at = None;
        account.login_count = login_count;
        account.last_login_at = Some(now);
        account.updated_at = now;

        tracing::info!(account_id = %account.id, "Successful sign-in");
        Ok(())
    }

    async fn unlock_expired(&self, account_id: &str, now: DateTime<Utc>) -> AuthResult<()> {
        sqlx::query(
            "UPDATE account
             SET is_locked = 0, locked_until = NULL, failed_login_count = 0,
                 last_failed_login_at = NULL, updated_at = ?1
             WHERE id = ?2 AND is_locked = 1 AND locked_until IS NOT NULL AND locked_until <= ?1",
        )
        .bind(now)
        .bind(account_id)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn find_by_email(&self, email: &str) -> AuthResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>("SELECT * FROM account WHERE email = ?1")
            .bind(email)
            .fetch_optional(&self.db)
            .await?;

        Ok(account)
    }

    async fn record_attempt(
        &self,
        account_id: Option<&str>,
        email: &str,
        meta: &RequestContext,
        success: bool,
        failure_reason: Option<&str>,
    ) -> AuthResult<()> {
        sqlx::query(
            "INSERT INTO login_attempt (id, account_id, email, ip_address, user_agent, success, failure_reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(account_id)
        .bind(email)
        .bind(&meta.ip)
        .bind(&meta.user_agent)
        .bind(success)
        .bind(failure_reason)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockoutConfig;
    use crate::test_support::{insert_account, setup_db, test_hasher};
    use chrono::Duration;

    const PASSWORD: &str = "Abc12345!";

    async fn verifier_with_account(email: &str) -> (SqlitePool, CredentialVerifier, Account) {
        let db = setup_db().await;
        let hasher = test_hasher();
        let hash = hasher.hash(PASSWORD).await.unwrap();
        let account = insert_account(&db, email, "alice", Some(&hash)).await;
        let verifier = CredentialVerifier::new(
            db.clone(),
            hasher,
            LockoutPolicy::from(&LockoutConfig::default()),
        );
        (db, verifier, account)
    }

    async fn attempts(db: &SqlitePool, success: bool) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM login_attempt WHERE success = ?1")
            .bind(success)
            .fetch_one(db)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_verify_success_updates_counters() {
        let (db, verifier, account) = verifier_with_account("alice@example.com").await;

        let verified = verifier
            .verify("  ALICE@example.com ", PASSWORD, &RequestContext::default())
            .await
            .unwrap();

        assert_eq!(verified.id, account.id);
        assert_eq!(verified.login_count, 1);
        assert!(verified.last_login_at.is_some());
        assert_eq!(attempts(&db, true).await, 1);
    }

    #[tokio::test]
    async fn test_unknown_account_and_wrong_password_look_alike() {
        let (db, verifier, _) = verifier_with_account("alice@example.com").await;
        let meta = RequestContext::default();

        let unknown = verifier.verify("nobody@example.com", PASSWORD, &meta).await;
        let wrong = verifier.verify("alice@example.com", "Wrong1234!", &meta).await;

        assert!(matches!(unknown, Err(AuthError::InvalidCredentials)));
        assert!(matches!(wrong, Err(AuthError::InvalidCredentials)));
        assert_eq!(attempts(&db, false).await, 2);
    }

    #[tokio::test]
    async fn test_lockout_after_threshold_even_with_correct_password() {
        let (db, verifier, account) = verifier_with_account("alice@example.com").await;
        let meta = RequestContext::default();

        for i in 1..=5 {
            let result = verifier.verify("alice@example.com", "Wrong1234!", &meta).await;
            if i < 5 {
                assert!(matches!(result, Err(AuthError::InvalidCredentials)));
            } else {
                assert!(matches!(
                    result,
                    Err(AuthError::AccountLocked { locked_until: Some(_) })
                ));
            }
        }

        match verifier.verify("alice@example.com", PASSWORD, &meta).await {
            Err(AuthError::AccountLocked {
                locked_until: Some(until),
            }) => assert!(until > Utc::now()),
            other => panic!("expected lock, got {:?}", other.map(|a| a.id)),
        }

        let (is_locked, login_count): (bool, i64) =
            sqlx::query_as("SELECT is_locked, login_count FROM account WHERE id = ?1")
                .bind(&account.id)
                .fetch_one(&db)
                .await
                .unwrap();
        assert!(is_locked);
        assert_eq!(login_count, 0);
    }

    #[tokio::test]
    async fn test_failures_outside_window_restart_count() {
        let (db, verifier, account) = verifier_with_account("alice@example.com").await;
        let meta = RequestContext::default();

        for _ in 0..4 {
            let _ = verifier.verify("alice@example.com", "Wrong1234!", &meta).await;
        }
        sqlx::query("UPDATE account SET last_failed_login_at = ?1 WHERE id = ?2")
            .bind(Utc::now() - Duration::hours(1))
            .bind(&account.id)
            .execute(&db)
            .await
            .unwrap();

        let result = verifier.verify("alice@example.com", "Wrong1234!", &meta).await;
        assert!(matches!(result, Err(AuthError::InvalidCredentials)));

        let count: i64 = sqlx::query_scalar("SELECT failed_login_count FROM account WHERE id = ?1")
            .bind(&account.id)
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_expired_lock_is_cleared_on_next_attempt() {
        let (db, verifier, account) = verifier_with_account("alice@example.com").await;

        sqlx::query(
            "UPDATE account SET is_locked = 1, locked_until = ?1, failed_login_count = 5 WHERE id = ?2",
        )
        .bind(Utc::now() - Duration::minutes(1))
        .bind(&account.id)
        .execute(&db)
        .await
        .unwrap();

        let verified = verifier
            .verify("alice@example.com", PASSWORD, &RequestContext::default())
            .await
            .unwrap();
        assert!(!verified.is_locked);
        assert_eq!(verified.failed_login_count, 0);

        let is_locked: bool = sqlx::query_scalar("SELECT is_locked FROM account WHERE id = ?1")
            .bind(&account.id)
            .fetch_one(&db)
            .await
            .unwrap();
        assert!(!is_locked);
    }

    #[tokio::test]
    async fn test_indefinite_lock_rejects() {
        let (db, verifier, account) = verifier_with_account("alice@example.com").await;

        sqlx::query("UPDATE account SET is_locked = 1, locked_until = NULL WHERE id = ?1")
            .bind(&account.id)
            .execute(&db)
            .await
            .unwrap();

        let result = verifier
            .verify("alice@example.com", PASSWORD, &RequestContext::default())
            .await;
        assert!(matches!(
            result,
            Err(AuthError::AccountLocked { locked_until: None })
        ));
    }

    #[tokio::test]
    async fn test_passwordless_account_cannot_sign_in() {
        let db = setup_db().await;
        insert_account(&db, "passkey@example.com", "passkey", None).await;
        let verifier = CredentialVerifier::new(
            db,
            test_hasher(),
            LockoutPolicy::from(&LockoutConfig::default()),
        );

        let result = verifier
            .verify("passkey@example.com", PASSWORD, &RequestContext::default())
            .await;
        assert!(matches!(result, Err(AuthError::InvalidCredentials)));
    }
}
