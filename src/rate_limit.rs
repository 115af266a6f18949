/// Rate Limiting System
///
/// One keyed GCRA limiter per action, keyed by `"<action>:<client ip>"`.
/// Exhausting an action's quota blocks the key for that action's block
/// duration, on top of the limiter's own replenishment.
use crate::{
    context::{AppContext, RequestContext},
    error::{AuthError, AuthResult},
    metrics,
};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use governor::{
    clock::DefaultClock,
    middleware::StateInformationMiddleware,
    state::keyed::DefaultKeyedStateStore,
    Quota, RateLimiter as GovernorLimiter,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    net::SocketAddr,
    num::NonZeroU32,
    sync::Mutex,
    time::{Duration, Instant},
};

type KeyedLimiter = GovernorLimiter<
    String,
    DefaultKeyedStateStore<String>,
    DefaultClock,
    StateInformationMiddleware,
>;

/// Rate-limited actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitAction {
    Login,
    Register,
    Refresh,
    Logout,
    ProfileUpdate,
    Admin,
}

impl RateLimitAction {
    pub const ALL: [RateLimitAction; 6] = [
        RateLimitAction::Login,
        RateLimitAction::Register,
        RateLimitAction::Refresh,
        RateLimitAction::Logout,
        RateLimitAction::ProfileUpdate,
        RateLimitAction::Admin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitAction::Login => "auth_login",
            RateLimitAction::Register => "auth_register",
            RateLimitAction::Refresh => "auth_refresh",
            RateLimitAction::Logout => "auth_logout",
            RateLimitAction::ProfileUpdate => "profile_update",
            RateLimitAction::Admin => "admin",
        }
    }
}

/// Window, attempt budget and block duration for one action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub window_secs: u64,
    pub max_attempts: u32,
    pub block_secs: u64,
}

impl RateLimitPolicy {
    const fn new(window_secs: u64, max_attempts: u32, block_secs: u64) -> Self {
        Self {
            window_secs,
            max_attempts,
            block_secs,
        }
    }

    fn quota(&self) -> AuthResult<Quota> {
        let burst = NonZeroU32::new(self.max_attempts)
            .ok_or_else(|| AuthError::validation("Rate limit attempts must be non-zero"))?;
        let period = Duration::from_secs(self.window_secs) / self.max_attempts;

        Quota::with_period(period)
            .map(|q| q.allow_burst(burst))
            .ok_or_else(|| AuthError::validation("Rate limit window must be non-zero"))
    }

    fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_secs)
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub login: RateLimitPolicy,
    pub register: RateLimitPolicy,
    pub refresh: RateLimitPolicy,
    pub logout: RateLimitPolicy,
    pub profile_update: RateLimitPolicy,
    pub admin: RateLimitPolicy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            login: RateLimitPolicy::new(15 * 60, 10, 30 * 60),
            register: RateLimitPolicy::new(3600, 5, 3600),
            refresh: RateLimitPolicy::new(60, 30, 5 * 60),
            logout: RateLimitPolicy::new(60, 30, 60),
            profile_update: RateLimitPolicy::new(15 * 60, 20, 15 * 60),
            admin: RateLimitPolicy::new(60, 100, 5 * 60),
        }
    }
}

impl RateLimitConfig {
    pub fn policy(&self, action: RateLimitAction) -> &RateLimitPolicy {
        match action {
            RateLimitAction::Login => &self.login,
            RateLimitAction::Register => &self.register,
            RateLimitAction::Refresh => &self.refresh,
            RateLimitAction::Logout => &self.logout,
            RateLimitAction::ProfileUpdate => &self.profile_update,
            RateLimitAction::Admin => &self.admin,
        }
    }
}

/// Result of one rate limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub reset_time: DateTime<Utc>,
    pub remaining: u32,
    pub limit: u32,
}

impl RateLimitDecision {
    /// Time until `reset_time`, never negative
    pub fn retry_after(&self) -> Duration {
        (self.reset_time - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Rate limiter manager
pub struct RateLimiter {
    enabled: bool,
    config: RateLimitConfig,
    limiters: HashMap<RateLimitAction, KeyedLimiter>,
    blocked: Mutex<HashMap<String, Instant>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> AuthResult<Self> {
        let mut limiters = HashMap::new();
        for action in RateLimitAction::ALL {
            let quota = config.policy(action).quota()?;
            limiters.insert(
                action,
                GovernorLimiter::keyed(quota).with_middleware::<StateInformationMiddleware>(),
            );
        }

        Ok(Self {
            enabled: config.enabled,
            config,
            limiters,
            blocked: Mutex::new(HashMap::new()),
        })
    }

    /// Count one attempt of `action` from `client` and decide whether it may proceed
    pub fn check_rate_limit(&self, client: &str, action: RateLimitAction) -> RateLimitDecision {
        let policy = self.config.policy(action);
        let now = Utc::now();

        if !self.enabled {
            return RateLimitDecision {
                allowed: true,
                reset_time: now,
                remaining: policy.max_attempts,
                limit: policy.max_attempts,
            };
        }

        let key = format!("{}:{}", action.as_str(), client);
        let mut blocked = self.blocked.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(until) = blocked.get(&key).copied() {
            let left = until.saturating_duration_since(Instant::now());
            if !left.is_zero() {
                return denied(policy, now, left);
            }
            blocked.remove(&key);
        }

        let Some(limiter) = self.limiters.get(&action) else {
            return denied(policy, now, policy.block_duration());
        };

        match limiter.check_key(&key) {
            Ok(snapshot) => {
                let remaining = snapshot.remaining_burst_capacity();
                let period = Duration::from_secs(policy.window_secs) / policy.max_attempts;
                let refill = period * policy.max_attempts.saturating_sub(remaining);
                RateLimitDecision {
                    allowed: true,
                    reset_time: now + to_chrono(refill),
                    remaining,
                    limit: policy.max_attempts,
                }
            }
            Err(_) => {
                let block = policy.block_duration();
                blocked.insert(key, Instant::now() + block);
                tracing::warn!(
                    action = action.as_str(),
                    client,
                    block_secs = policy.block_secs,
                    "Rate limit exceeded; client blocked"
                );
                denied(policy, now, block)
            }
        }
    }

    /// Check and turn a rejection into `RateLimited`
    pub fn enforce(
        &self,
        meta: &RequestContext,
        action: RateLimitAction,
    ) -> AuthResult<RateLimitDecision> {
        let decision = self.check_rate_limit(meta.client_key(), action);
        if decision.allowed {
            return Ok(decision);
        }

        metrics::record_rate_limited(action.as_str());
        Err(AuthError::RateLimited {
            retry_after: decision.retry_after(),
        })
    }

    /// Drop idle limiter state and expired blocks. Returns the number of
    /// blocks removed.
    pub fn cleanup(&self) -> usize {
        for limiter in self.limiters.values() {
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }

        let now = Instant::now();
        let mut blocked = self.blocked.lock().unwrap_or_else(|e| e.into_inner());
        let before = blocked.len();
        blocked.retain(|_, until| *until > now);
        before - blocked.len()
    }

    /// Tracked keys across all actions
    pub fn tracked_keys(&self) -> usize {
        self.limiters.values().map(|l| l.len()).sum()
    }
}

fn denied(policy: &RateLimitPolicy, now: DateTime<Utc>, wait: Duration) -> RateLimitDecision {
    RateLimitDecision {
        allowed: false,
        reset_time: now + to_chrono(wait),
        remaining: 0,
        limit: policy.max_attempts,
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Rate limiting middleware for one action.
///
/// Mounted per route with `from_fn_with_state((ctx, action), ...)`.
pub async fn rate_limit_middleware(
    State((ctx, action)): State<(AppContext, RateLimitAction)>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let meta = RequestContext::from_headers(
        request.headers(),
        peer,
        ctx.config.service.trust_proxy_headers,
    );

    match ctx.rate_limiter.enforce(&meta, action) {
        Ok(decision) => {
            let mut response = next.run(request).await;

            // Add rate limit headers to response
            let headers = response.headers_mut();
            headers.insert("X-RateLimit-Limit", HeaderValue::from(decision.limit));
            headers.insert("X-RateLimit-Remaining", HeaderValue::from(decision.remaining));
            headers.insert(
                "X-RateLimit-Reset",
                HeaderValue::from(decision.reset_time.timestamp()),
            );

            response
        }
        Err(e) => e.into_response(),
    }
}
