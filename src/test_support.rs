/// Shared fixtures for unit and router tests
use crate::{
    config::{
        AuthConfig, LockoutConfig, LoggingConfig, ServerConfig, ServiceConfig, StorageConfig,
    },
    context::AppContext,
    crypto::password::PasswordHasher,
    db::{self, account::Account},
    rate_limit::RateLimitConfig,
};
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

pub const TEST_SECRET: &str = "test-secret-key-that-is-at-least-32-bytes";

/// Lowest bcrypt cost the library accepts
pub const TEST_BCRYPT_COST: u32 = 4;

pub fn test_config() -> ServerConfig {
    ServerConfig {
        service: ServiceConfig {
            hostname: "127.0.0.1".to_string(),
            port: 0,
            version: "test".to_string(),
            trust_proxy_headers: false,
        },
        storage: StorageConfig {
            data_directory: "./data".into(),
            account_db: ":memory:".into(),
            login_attempt_retention_days: 30,
        },
        authentication: AuthConfig {
            jwt_secret: TEST_SECRET.to_string(),
            bcrypt_cost: TEST_BCRYPT_COST,
            secure_cookies: false,
            ..AuthConfig::default()
        },
        lockout: LockoutConfig::default(),
        rate_limit: RateLimitConfig::default(),
        logging: LoggingConfig {
            level: "debug".to_string(),
            json: false,
        },
    }
}

pub fn test_hasher() -> PasswordHasher {
    PasswordHasher::new(TEST_BCRYPT_COST).expect("test hasher")
}

/// In-memory database with migrations applied
pub async fn setup_db() -> SqlitePool {
    let pool = db::create_memory_pool().await.expect("memory pool");
    db::run_migrations(&pool).await.expect("migrations");
    pool
}

/// Insert an account row directly, bypassing registration rules
pub async fn insert_account(
    db: &SqlitePool,
    email: &str,
    username: &str,
    password_hash: Option<&str>,
) -> Account {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();

    sqlx::query(
        "INSERT INTO account (id, email, username, password_hash, role, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'user', ?5, ?5)",
    )
    .bind(&id)
    .bind(email)
    .bind(username)
    .bind(password_hash)
    .bind(now)
    .execute(db)
    .await
    .expect("insert account");

    sqlx::query_as::<_, Account>("SELECT * FROM account WHERE id = ?1")
        .bind(&id)
        .fetch_one(db)
        .await
        .expect("fetch account")
}

/// Full application context over a fresh in-memory database
pub async fn test_context(config: ServerConfig) -> AppContext {
    let db = setup_db().await;
    AppContext::with_pool(config, db).expect("app context")
}
