/// Password hashing
///
/// bcrypt is CPU-bound, so every hash and verify runs on tokio's blocking
/// pool instead of the request task.
use crate::error::{AuthError, AuthResult};
use std::sync::Arc;

/// bcrypt hasher with a fixed cost and a precomputed decoy hash
#[derive(Clone)]
pub struct PasswordHasher {
    cost: u32,
    /// Verified against when there is no real hash, so that "no such account"
    /// costs the same as "wrong password".
    dummy_hash: Arc<String>,
}

impl PasswordHasher {
    pub fn new(cost: u32) -> AuthResult<Self> {
        let dummy_hash = bcrypt::hash("gatehouse-timing-decoy", cost)
            .map_err(|e| AuthError::Internal(format!("Password hashing failed: {}", e)))?;

        Ok(Self {
            cost,
            dummy_hash: Arc::new(dummy_hash),
        })
    }

    /// Hash a password
    pub async fn hash(&self, password: &str) -> AuthResult<String> {
        let password = password.to_owned();
        let cost = self.cost;

        tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
            .await
            .map_err(|e| AuthError::Internal(format!("Hashing task failed: {}", e)))?
            .map_err(|e| AuthError::Internal(format!("Password hashing failed: {}", e)))
    }

    /// Verify a password against a stored hash.
    ///
    /// `None` verifies against the decoy and always returns false.
    pub async fn verify(&self, password: &str, hash: Option<&str>) -> AuthResult<bool> {
        let password = password.to_owned();
        let (hash, real) = match hash {
            Some(h) => (h.to_owned(), true),
            None => (self.dummy_hash.as_ref().clone(), false),
        };

        let matched = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
            .await
            .map_err(|e| AuthError::Internal(format!("Verification task failed: {}", e)))?
            .map_err(|e| AuthError::Internal(format!("Password verification failed: {}", e)))?;

        Ok(real && matched)
    }
}
