/// Application context and dependency injection
use crate::{
    account::{AccountManager, CredentialVerifier, LockoutPolicy},
    config::ServerConfig,
    crypto::password::PasswordHasher,
    db,
    error::{AuthError, AuthResult},
    rate_limit::RateLimiter,
    revocation::RevocationLedger,
    session::SessionStore,
    token::TokenIssuer,
};
use axum::http::{header, HeaderMap};
use sqlx::SqlitePool;
use std::{net::SocketAddr, sync::Arc};

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub db: SqlitePool,
    pub accounts: Arc<AccountManager>,
    pub verifier: Arc<CredentialVerifier>,
    pub tokens: Arc<TokenIssuer>,
    pub sessions: Arc<SessionStore>,
    pub ledger: Arc<RevocationLedger>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppContext {
    /// Create a new application context from configuration
    pub async fn new(config: ServerConfig) -> AuthResult<Self> {
        // Validate configuration
        config.validate()?;

        // Create data directory if it doesn't exist
        if !config.storage.data_directory.exists() {
            tokio::fs::create_dir_all(&config.storage.data_directory)
                .await
                .map_err(|e| {
                    AuthError::Internal(format!(
                        "Failed to create directory {:?}: {}",
                        config.storage.data_directory, e
                    ))
                })?;
        }

        // Initialize database and run migrations
        let db = db::create_pool(&config.storage.account_db, db::DatabaseOptions::default()).await?;
        db::run_migrations(&db).await?;
        db::test_connection(&db).await?;

        Self::with_pool(config, db)
    }

    /// Wire every service onto an already migrated pool
    pub fn with_pool(config: ServerConfig, db: SqlitePool) -> AuthResult<Self> {
        let hasher = PasswordHasher::new(config.authentication.bcrypt_cost)?;

        let accounts = Arc::new(AccountManager::new(db.clone(), hasher.clone()));
        let verifier = Arc::new(CredentialVerifier::new(
            db.clone(),
            hasher,
            LockoutPolicy::from(&config.lockout),
        ));
        let tokens = Arc::new(TokenIssuer::new(db.clone(), config.authentication.clone()));
        let ledger = Arc::new(RevocationLedger::new(db.clone()));
        let sessions = Arc::new(SessionStore::new(
            db.clone(),
            config.authentication.clone(),
            tokens.clone(),
            ledger.clone(),
            accounts.clone(),
        ));
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone())?);

        Ok(Self {
            config: Arc::new(config),
            db,
            accounts,
            verifier,
            tokens,
            sessions,
            ledger,
            rate_limiter,
        })
    }

    /// Get service URL
    pub fn service_url(&self) -> String {
        format!(
            "http://{}:{}",
            self.config.service.hostname, self.config.service.port
        )
    }
}

/// Per-request client metadata, extracted once and passed into the core
/// services so they never see the transport's request type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub device_id: Option<String>,
}

const MAX_HEADER_VALUE_LEN: usize = 512;

impl RequestContext {
    /// Build from request headers and the socket peer, if known.
    ///
    /// The peer address is the client IP unless `trust_proxy` is set, in
    /// which case the first `X-Forwarded-For` hop, then `X-Real-IP`, win.
    pub fn from_headers(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy: bool) -> Self {
        let forwarded = || {
            header_str(headers, "x-forwarded-for")
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .or_else(|| {
                    header_str(headers, "x-real-ip")
                        .map(str::trim)
                        .filter(|v| !v.is_empty())
                        .map(str::to_string)
                })
        };

        let ip = trust_proxy
            .then(forwarded)
            .flatten()
            .or_else(|| peer.map(|p| p.ip().to_string()));

        Self {
            ip,
            user_agent: header_str(headers, header::USER_AGENT.as_str()).map(truncate),
            device_id: header_str(headers, "x-device-id").map(truncate),
        }
    }

    /// Key used by the rate limiter
    pub fn client_key(&self) -> &str {
        self.ip.as_deref().unwrap_or("unknown")
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn truncate(value: &str) -> String {
    value.chars().take(MAX_HEADER_VALUE_LEN).collect()
}
