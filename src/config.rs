/// Configuration management for Gatehouse
use crate::error::{AuthError, AuthResult};
use crate::rate_limit::RateLimitConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub authentication: AuthConfig,
    pub lockout: LockoutConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub hostname: String,
    pub port: u16,
    pub version: String,
    /// Take the client IP from `X-Forwarded-For`/`X-Real-IP`. Only safe
    /// behind a reverse proxy that overwrites those headers.
    pub trust_proxy_headers: bool,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_directory: PathBuf,
    pub account_db: PathBuf,
    /// How long login attempt audit rows are kept, in days
    pub login_attempt_retention_days: i64,
}

/// Token, session and password hashing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub access_token_ttl_secs: i64,
    pub refresh_token_ttl_secs: i64,
    /// Refresh tokens with less remaining lifetime than this are rotated
    pub refresh_rotation_threshold_secs: i64,
    /// Session lifetime when "remember me" is not requested
    pub session_ttl_secs: i64,
    pub bcrypt_cost: u32,
    pub leeway_secs: u64,
    pub secure_cookies: bool,
}

/// Account lockout policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockoutConfig {
    pub max_failed_attempts: i64,
    pub window_secs: i64,
    pub lock_duration_secs: i64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            jwt_issuer: "gatehouse".to_string(),
            access_token_ttl_secs: 15 * 60,
            refresh_token_ttl_secs: 30 * 24 * 3600,
            refresh_rotation_threshold_secs: 3600,
            session_ttl_secs: 24 * 3600,
            bcrypt_cost: 12,
            leeway_secs: 30,
            secure_cookies: true,
        }
    }
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            max_failed_attempts: 5,
            window_secs: 15 * 60,
            lock_duration_secs: 30 * 60,
        }
    }
}

/// Parse an optional environment variable, falling back to `default` when unset
/// or unparseable.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> AuthResult<Self> {
        dotenv::dotenv().ok();

        let hostname = env::var("GATEHOUSE_HOSTNAME").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("GATEHOUSE_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| AuthError::validation("Invalid port number"))?;
        let version = env!("CARGO_PKG_VERSION").to_string();
        let trust_proxy_headers = env_or("GATEHOUSE_TRUST_PROXY_HEADERS", false);

        let data_directory: PathBuf = env::var("GATEHOUSE_DATA_DIRECTORY")
            .unwrap_or_else(|_| "./data".to_string())
            .into();
        let account_db = env::var("GATEHOUSE_DB_LOCATION")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_directory.join("gatehouse.sqlite"));
        let login_attempt_retention_days = env_or("GATEHOUSE_LOGIN_ATTEMPT_RETENTION_DAYS", 30);

        let jwt_secret = env::var("GATEHOUSE_JWT_SECRET")
            .map_err(|_| AuthError::validation("JWT secret required (GATEHOUSE_JWT_SECRET)"))?;

        let defaults = AuthConfig::default();
        let authentication = AuthConfig {
            jwt_secret,
            jwt_issuer: env::var("GATEHOUSE_JWT_ISSUER").unwrap_or(defaults.jwt_issuer),
            access_token_ttl_secs: env_or("GATEHOUSE_ACCESS_TOKEN_TTL", defaults.access_token_ttl_secs),
            refresh_token_ttl_secs: env_or(
                "GATEHOUSE_REFRESH_TOKEN_TTL",
                defaults.refresh_token_ttl_secs,
            ),
            refresh_rotation_threshold_secs: env_or(
                "GATEHOUSE_REFRESH_ROTATION_THRESHOLD",
                defaults.refresh_rotation_threshold_secs,
            ),
            session_ttl_secs: env_or("GATEHOUSE_SESSION_TTL", defaults.session_ttl_secs),
            bcrypt_cost: env_or("GATEHOUSE_BCRYPT_COST", defaults.bcrypt_cost),
            leeway_secs: env_or("GATEHOUSE_JWT_LEEWAY", defaults.leeway_secs),
            secure_cookies: env_or("GATEHOUSE_SECURE_COOKIES", defaults.secure_cookies),
        };

        let lockout_defaults = LockoutConfig::default();
        let lockout = LockoutConfig {
            max_failed_attempts: env_or(
                "GATEHOUSE_LOCKOUT_MAX_ATTEMPTS",
                lockout_defaults.max_failed_attempts,
            ),
            window_secs: env_or("GATEHOUSE_LOCKOUT_WINDOW", lockout_defaults.window_secs),
            lock_duration_secs: env_or(
                "GATEHOUSE_LOCKOUT_DURATION",
                lockout_defaults.lock_duration_secs,
            ),
        };

        let rate_limit = RateLimitConfig {
            enabled: env_or("GATEHOUSE_RATE_LIMITS_ENABLED", true),
            ..RateLimitConfig::default()
        };

        let level = env::var("RUST_LOG")
            .unwrap_or_else(|_| "gatehouse=debug,tower_http=debug".to_string());
        let json = env::var("GATEHOUSE_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        Ok(ServerConfig {
            service: ServiceConfig {
                hostname,
                port,
                version,
                trust_proxy_headers,
            },
            storage: StorageConfig {
                data_directory,
                account_db,
                login_attempt_retention_days,
            },
            authentication,
            lockout,
            rate_limit,
            logging: LoggingConfig { level, json },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> AuthResult<()> {
        if self.service.hostname.is_empty() {
            return Err(AuthError::validation("Hostname cannot be empty"));
        }

        if self.authentication.jwt_secret.len() < 32 {
            return Err(AuthError::validation(
                "JWT secret must be at least 32 characters",
            ));
        }

        if !(12..=31).contains(&self.authentication.bcrypt_cost) {
            return Err(AuthError::validation("bcrypt cost must be between 12 and 31"));
        }

        if self.authentication.refresh_token_ttl_secs <= self.authentication.access_token_ttl_secs {
            return Err(AuthError::validation(
                "Refresh token TTL must exceed access token TTL",
            ));
        }

        if self.lockout.max_failed_attempts < 1 {
            return Err(AuthError::validation(
                "Lockout threshold must be at least one attempt",
            ));
        }

        Ok(())
    }
}
