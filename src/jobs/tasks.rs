/// Background task implementations
use crate::{context::AppContext, error::AuthResult, metrics};
use chrono::{Duration, Utc};

/// Cleanup expired sessions and refresh tokens
pub async fn cleanup_expired_sessions(ctx: &AppContext) -> AuthResult<u64> {
    let sessions_deleted = ctx.sessions.cleanup_expired().await?;
    let refresh_tokens_deleted = ctx.tokens.cleanup_expired().await?;

    metrics::record_cleanup("session", sessions_deleted);
    metrics::record_cleanup("refresh_token", refresh_tokens_deleted);

    Ok(sessions_deleted + refresh_tokens_deleted)
}

/// Drop revocation entries whose token would have expired anyway
pub async fn cleanup_revocation_entries(ctx: &AppContext) -> AuthResult<u64> {
    let deleted = ctx.ledger.cleanup_expired().await?;
    metrics::record_cleanup("revocation_entry", deleted);
    Ok(deleted)
}

/// Prune login attempts past the configured retention
pub async fn prune_login_attempts(ctx: &AppContext) -> AuthResult<u64> {
    let retention = Duration::days(ctx.config.storage.login_attempt_retention_days);
    let deleted = ctx
        .accounts
        .cleanup_login_attempts(Utc::now() - retention)
        .await?;

    metrics::record_cleanup("login_attempt", deleted);
    Ok(deleted)
}

/// Forget idle rate-limiter keys and lapsed blocks
pub fn trim_rate_limiter(ctx: &AppContext) -> usize {
    ctx.rate_limiter.cleanup()
}

/// Health check - verify the store is reachable
pub async fn health_check(ctx: &AppContext) -> AuthResult<()> {
    sqlx::query("SELECT 1").fetch_one(&ctx.db).await?;
    Ok(())
}
