use crate::{context::AppContext, error::AuthResult, metrics};
use std::{future::Future, sync::Arc, time::Instant};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};

pub mod tasks;

/// Job scheduler for background tasks
pub struct JobScheduler {
    context: Arc<AppContext>,
}

impl JobScheduler {
    pub fn new(context: Arc<AppContext>) -> Self {
        Self { context }
    }

    /// Start all background jobs
    pub fn start(self: Arc<Self>) {
        info!("Starting background job scheduler");

        // Spawn cleanup tasks
        tokio::spawn(Self::expired_session_cleanup_job(Arc::clone(&self)));
        tokio::spawn(Self::revocation_cleanup_job(Arc::clone(&self)));
        tokio::spawn(Self::login_attempt_prune_job(Arc::clone(&self)));
        tokio::spawn(Self::rate_limiter_trim_job(Arc::clone(&self)));

        // Spawn monitoring tasks
        tokio::spawn(Self::health_check_job(Arc::clone(&self)));

        info!("Background jobs started");
    }

    /// Run one job iteration, recording its outcome and duration
    async fn run<F, Fut>(job_type: &str, job: F) -> AuthResult<u64>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AuthResult<u64>>,
    {
        let start = Instant::now();
        let result = job().await;
        let status = if result.is_ok() { "success" } else { "failure" };
        metrics::record_background_job(job_type, status, start.elapsed().as_secs_f64());
        result
    }

    /// Cleanup expired sessions and refresh tokens (runs every hour)
    async fn expired_session_cleanup_job(scheduler: Arc<Self>) {
        let mut interval = interval(Duration::from_secs(3600));

        loop {
            interval.tick().await;
            info!("Running expired session cleanup");

            match Self::run("session_cleanup", || {
                tasks::cleanup_expired_sessions(&scheduler.context)
            })
            .await
            {
                Ok(count) if count > 0 => {
                    info!(count, "Cleaned up expired sessions and refresh tokens")
                }
                Ok(_) => info!("Session cleanup: nothing expired"),
                Err(e) => error!(error = %e, "Failed to cleanup expired sessions"),
            }
        }
    }

    /// Purge revocation entries past their token's expiry (runs every 30 minutes)
    async fn revocation_cleanup_job(scheduler: Arc<Self>) {
        let mut interval = interval(Duration::from_secs(1800));

        loop {
            interval.tick().await;

            match Self::run("revocation_cleanup", || {
                tasks::cleanup_revocation_entries(&scheduler.context)
            })
            .await
            {
                Ok(count) if count > 0 => info!(count, "Purged expired revocation entries"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "Failed to purge revocation entries"),
            }
        }
    }

    /// Prune login attempts past retention (runs daily)
    async fn login_attempt_prune_job(scheduler: Arc<Self>) {
        let mut interval = interval(Duration::from_secs(86400));

        loop {
            interval.tick().await;
            info!("Running login attempt pruning");

            match Self::run("login_attempt_prune", || {
                tasks::prune_login_attempts(&scheduler.context)
            })
            .await
            {
                Ok(count) => info!(count, "Pruned old login attempts"),
                Err(e) => error!(error = %e, "Failed to prune login attempts"),
            }
        }
    }

    /// Trim idle rate-limiter state (runs every 5 minutes)
    async fn rate_limiter_trim_job(scheduler: Arc<Self>) {
        let mut interval = interval(Duration::from_secs(300));

        loop {
            interval.tick().await;

            let start = Instant::now();
            let released = tasks::trim_rate_limiter(&scheduler.context);
            metrics::record_background_job(
                "rate_limiter_trim",
                "success",
                start.elapsed().as_secs_f64(),
            );
            debug!(
                released_blocks = released,
                tracked_keys = scheduler.context.rate_limiter.tracked_keys(),
                "Rate limiter trimmed"
            );
        }
    }

    /// Health check job (runs every 5 minutes)
    async fn health_check_job(scheduler: Arc<Self>) {
        let mut interval = interval(Duration::from_secs(300));

        loop {
            interval.tick().await;

            if let Err(e) = tasks::health_check(&scheduler.context).await {
                error!(error = %e, "Health check failed");
            }
        }
    }
}
