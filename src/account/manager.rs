/// Account manager implementation using runtime queries
/// This version uses sqlx runtime query building instead of compile-time macros
/// to avoid needing DATABASE_URL during compilation

use crate::{
    account::RegisterRequest,
    crypto::password::PasswordHasher,
    db::account::{Account, LoginAttempt, Role},
    error::{AuthError, AuthResult},
    metrics,
    validation::normalize_email,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use uuid::Uuid;

/// One page of accounts, ordered by creation time then id
#[derive(Debug, Clone)]
pub struct AccountPage {
    pub accounts: Vec<Account>,
    pub cursor: Option<String>,
}

/// Cursor position: the last row of the previous page
#[derive(Debug, Serialize, serde::Deserialize)]
struct PageCursor {
    created_at: DateTime<Utc>,
    id: String,
}

/// Account manager service
pub struct AccountManager {
    db: SqlitePool,
    hasher: PasswordHasher,
}

impl AccountManager {
    /// Create a new account manager
    pub fn new(db: SqlitePool, hasher: PasswordHasher) -> Self {
        Self { db, hasher }
    }

    /// Create a new account from a validated registration request
    pub async fn create_account(&self, request: &RegisterRequest) -> AuthResult<Account> {
        let email = normalize_email(&request.email);
        let username = request.username.trim().to_string();

        // Check if email already exists
        if self.email_exists(&email).await? {
            return Err(AuthError::Conflict("Email already registered".to_string()));
        }

        // Check if username already exists
        if self.username_exists(&username).await? {
            return Err(AuthError::Conflict(format!("Username {} already taken", username)));
        }

        let password_hash = self.hasher.hash(&request.password).await?;

        let now = Utc::now();
        let account = Account {
            id: Uuid::new_v4().to_string(),
            email,
            username,
            password_hash: Some(password_hash),
            role: Role::User,
            is_locked: false,
            locked_until: None,
            failed_login_count: 0,
            last_failed_login_at: None,
            login_count: 0,
            last_login_at: None,
            created_at: now,
            updated_at: now,
        };

        // The pre-checks above can race; the unique indexes decide.
        let inserted = sqlx::query(
            "INSERT INTO account (id, email, username, password_hash, role, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        )
        .bind(&account.id)
        .bind(&account.email)
        .bind(&account.username)
        .bind(&account.password_hash)
        .bind(account.role)
        .bind(now)
        .execute(&self.db)
        .await
        .map_err(AuthError::from);

        if let Err(e) = inserted {
            if e.is_unique_violation() {
                return Err(AuthError::Conflict(
                    "Email or username already registered".to_string(),
                ));
            }
            return Err(e);
        }

        metrics::record_account_created();
        tracing::info!(account_id = %account.id, username = %account.username, "Account created");

        Ok(account)
    }

    /// Get account by id
    pub async fn get_account(&self, id: &str) -> AuthResult<Account> {
        sqlx::query_as::<_, Account>("SELECT * FROM account WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| AuthError::NotFound(format!("Account {} not found", id)))
    }

    /// Check if email exists
    pub async fn email_exists(&self, email: &str) -> AuthResult<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM account WHERE email = ?1")
            .bind(normalize_email(email))
            .fetch_one(&self.db)
            .await?;

        Ok(count > 0)
    }

    /// Check if username exists (case-insensitive)
    pub async fn username_exists(&self, username: &str) -> AuthResult<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM account WHERE username = ?1")
            .bind(username)
            .fetch_one(&self.db)
            .await?;

        Ok(count > 0)
    }

    /// Change username. Same uniqueness rules as registration.
    pub async fn update_username(&self, id: &str, username: &str) -> AuthResult<Account> {
        let username = username.trim();
        let current = self.get_account(id).await?;

        if current.username == username {
            return Ok(current);
        }

        // A case-only change of one's own name is not a conflict.
        if !current.username.eq_ignore_ascii_case(username) && self.username_exists(username).await? {
            return Err(AuthError::Conflict(format!("Username {} already taken", username)));
        }

        let result = sqlx::query("UPDATE account SET username = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(username)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.db)
            .await
            .map_err(AuthError::from);

        match result {
            Err(e) if e.is_unique_violation() => {
                return Err(AuthError::Conflict(format!("Username {} already taken", username)))
            }
            Err(e) => return Err(e),
            Ok(_) => {}
        }

        tracing::info!(account_id = %id, username, "Username changed");
        self.get_account(id).await
    }

    /// Change the password of an account.
    ///
    /// The write only lands if the stored hash is still the one the current
    /// password was checked against, so of several concurrent changes at most
    /// one succeeds.
    pub async fn change_password(
        &self,
        id: &str,
        current_password: &str,
        new_password: &str,
    ) -> AuthResult<()> {
        let account = self.get_account(id).await?;

        let Some(old_hash) = account.password_hash.as_deref() else {
            // Still pay for a comparison.
            self.hasher.verify(current_password, None).await?;
            return Err(AuthError::InvalidCredentials);
        };

        if !self.hasher.verify(current_password, Some(old_hash)).await? {
            tracing::debug!(account_id = %id, "Password change rejected: current password mismatch");
            return Err(AuthError::InvalidCredentials);
        }

        let new_hash = self.hasher.hash(new_password).await?;

        let updated = sqlx::query(
            "UPDATE account SET password_hash = ?1, updated_at = ?2 WHERE id = ?3 AND password_hash = ?4",
        )
        .bind(&new_hash)
        .bind(Utc::now())
        .bind(id)
        .bind(old_hash)
        .execute(&self.db)
        .await?
        .rows_affected();

        if updated == 0 {
            tracing::warn!(account_id = %id, "Concurrent password change lost the race");
            return Err(AuthError::Conflict(
                "Password was changed by another request".to_string(),
            ));
        }

        tracing::info!(account_id = %id, "Password changed");
        Ok(())
    }

    /// Set account role
    pub async fn set_role(&self, id: &str, role: Role) -> AuthResult<Account> {
        let result = sqlx::query("UPDATE account SET role = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(role)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AuthError::NotFound(format!("Account {} not found", id)));
        }

        tracing::info!(account_id = %id, role = role.as_str(), "Role changed");
        self.get_account(id).await
    }

    /// Lock an account. `None` locks until an admin unlocks it.
    pub async fn lock_account(&self, id: &str, until: Option<DateTime<Utc>>) -> AuthResult<Account> {
        let result = sqlx::query(
            "UPDATE account SET is_locked = 1, locked_until = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(until)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AuthError::NotFound(format!("Account {} not found", id)));
        }

        metrics::record_lockout();
        tracing::info!(account_id = %id, locked_until = ?until, "Account locked by admin");
        self.get_account(id).await
    }

    /// Unlock an account immediately and reset its failure counter
    pub async fn unlock_account(&self, id: &str) -> AuthResult<Account> {
        let result = sqlx::query(
            "UPDATE account
             SET is_locked = 0, locked_until = NULL, failed_login_count = 0,
                 last_failed_login_at = NULL, updated_at = ?1
             WHERE id = ?2",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AuthError::NotFound(format!("Account {} not found", id)));
        }

        tracing::info!(account_id = %id, "Account unlocked by admin");
        self.get_account(id).await
    }

    /// List accounts with cursor-based pagination
    pub async fn list_accounts(&self, limit: i64, cursor: Option<&str>) -> AuthResult<AccountPage> {
        let limit = limit.clamp(1, 100);

        let mut accounts = match cursor {
            Some(cursor) => {
                let cursor = decode_cursor(cursor)?;
                sqlx::query_as::<_, Account>(
                    "SELECT * FROM account
                     WHERE created_at > ?1 OR (created_at = ?1 AND id > ?2)
                     ORDER BY created_at, id
                     LIMIT ?3",
                )
                .bind(cursor.created_at)
                .bind(cursor.id)
                .bind(limit + 1)
                .fetch_all(&self.db)
                .await?
            }
            None => {
                sqlx::query_as::<_, Account>("SELECT * FROM account ORDER BY created_at, id LIMIT ?1")
                    .bind(limit + 1)
                    .fetch_all(&self.db)
                    .await?
            }
        };

        let cursor = if accounts.len() as i64 > limit {
            accounts.truncate(limit as usize);
            accounts.last().map(encode_cursor).transpose()?
        } else {
            None
        };

        Ok(AccountPage { accounts, cursor })
    }

    /// Most recent login attempts of an account
    pub async fn login_attempts(&self, id: &str, limit: i64) -> AuthResult<Vec<LoginAttempt>> {
        // 404 for unknown accounts rather than an empty list
        self.get_account(id).await?;

        let attempts = sqlx::query_as::<_, LoginAttempt>(
            "SELECT id, account_id, email, ip_address, user_agent, success, failure_reason, created_at
             FROM login_attempt WHERE account_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )
        .bind(id)
        .bind(limit.clamp(1, 200))
        .fetch_all(&self.db)
        .await?;

        Ok(attempts)
    }

    /// Number of registered passkeys
    pub async fn passkey_count(&self, id: &str) -> AuthResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM webauthn_credential WHERE account_id = ?1")
                .bind(id)
                .fetch_one(&self.db)
                .await?;

        Ok(count)
    }

    /// Prune login attempts older than the retention cutoff
    pub async fn cleanup_login_attempts(&self, older_than: DateTime<Utc>) -> AuthResult<u64> {
        let result = sqlx::query("DELETE FROM login_attempt WHERE created_at < ?1")
            .bind(older_than)
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected())
    }
}

fn encode_cursor(account: &Account) -> AuthResult<String> {
    use base64::Engine;

    let cursor = PageCursor {
        created_at: account.created_at,
        id: account.id.clone(),
    };
    let json = serde_json::to_vec(&cursor)
        .map_err(|e| AuthError::Internal(format!("Failed to encode cursor: {}", e)))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json))
}

fn decode_cursor(cursor: &str) -> AuthResult<PageCursor> {
    use base64::Engine;

    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(cursor)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .ok_or_else(|| AuthError::validation("Invalid pagination cursor"))
}
