/// Metrics and telemetry for Gatehouse
///
/// Provides Prometheus-compatible metrics for monitoring:
/// - HTTP request counts and latencies
/// - Sign-in outcomes and lockouts
/// - Token issuance, rotation and revocation
/// - Rate limit rejections
/// - Background job execution

use crate::token::TokenType;
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    // ========== HTTP Metrics ==========

    /// Total HTTP requests by method, path, and status
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gatehouse_http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    /// HTTP request duration in seconds
    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "gatehouse_http_request_duration_seconds",
        "HTTP request latencies in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .unwrap();

    /// Active HTTP requests
    pub static ref HTTP_REQUESTS_ACTIVE: IntGauge = register_int_gauge!(
        "gatehouse_http_requests_active",
        "Number of HTTP requests currently being processed"
    )
    .unwrap();

    // ========== Authentication Metrics ==========

    /// Sign-in attempts by outcome
    pub static ref LOGIN_ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gatehouse_login_attempts_total",
        "Total number of sign-in attempts",
        &["outcome"]
    )
    .unwrap();

    /// Accounts locked, automatically or by an admin
    pub static ref ACCOUNT_LOCKOUTS_TOTAL: IntCounter = register_int_counter!(
        "gatehouse_account_lockouts_total",
        "Total number of account lockouts"
    )
    .unwrap();

    /// Accounts created
    pub static ref ACCOUNTS_CREATED_TOTAL: IntCounter = register_int_counter!(
        "gatehouse_accounts_created_total",
        "Total number of accounts created"
    )
    .unwrap();

    // ========== Token Metrics ==========

    /// Tokens minted by type
    pub static ref TOKENS_ISSUED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gatehouse_tokens_issued_total",
        "Total number of tokens issued",
        &["token_type"]
    )
    .unwrap();

    /// Refresh requests by outcome (reused, rotated)
    pub static ref TOKEN_REFRESHES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gatehouse_token_refreshes_total",
        "Total number of token refreshes",
        &["outcome"]
    )
    .unwrap();

    /// Tokens blacklisted by reason
    pub static ref TOKEN_REVOCATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gatehouse_token_revocations_total",
        "Total number of blacklisted tokens",
        &["reason"]
    )
    .unwrap();

    // ========== Rate Limit Metrics ==========

    /// Requests rejected by the rate limiter, by action
    pub static ref RATE_LIMITED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gatehouse_rate_limited_total",
        "Total number of rate limited requests",
        &["action"]
    )
    .unwrap();

    // ========== Background Job Metrics ==========

    /// Background job executions by job type and status
    pub static ref BACKGROUND_JOBS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gatehouse_background_jobs_total",
        "Total number of background job executions",
        &["job_type", "status"]
    )
    .unwrap();

    /// Background job duration in seconds
    pub static ref BACKGROUND_JOB_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "gatehouse_background_job_duration_seconds",
        "Background job execution time in seconds",
        &["job_type"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]
    )
    .unwrap();

    /// Rows removed by cleanup jobs
    pub static ref CLEANUP_ROWS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gatehouse_cleanup_rows_total",
        "Total number of rows removed by cleanup jobs",
        &["table"]
    )
    .unwrap();
}

/// Outcome of one sign-in attempt
#[derive(Debug, Clone, Copy)]
pub enum LoginOutcome {
    Success,
    InvalidCredentials,
    Locked,
}

impl LoginOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            LoginOutcome::Success => "success",
            LoginOutcome::InvalidCredentials => "invalid_credentials",
            LoginOutcome::Locked => "locked",
        }
    }
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Record an HTTP request
pub fn record_http_request(method: &str, path: &str, status: u16, duration: f64) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration);
}

/// Record a sign-in attempt
pub fn record_login(outcome: LoginOutcome) {
    LOGIN_ATTEMPTS_TOTAL
        .with_label_values(&[outcome.as_str()])
        .inc();
}

/// Record an account lockout
pub fn record_lockout() {
    ACCOUNT_LOCKOUTS_TOTAL.inc();
}

/// Record an account creation
pub fn record_account_created() {
    ACCOUNTS_CREATED_TOTAL.inc();
}

/// Record a minted token
pub fn record_token_issued(token_type: TokenType) {
    TOKENS_ISSUED_TOTAL
        .with_label_values(&[token_type.as_str()])
        .inc();
}

/// Record a refresh that kept the presented refresh token
pub fn record_refresh_reuse() {
    TOKEN_REFRESHES_TOTAL.with_label_values(&["reused"]).inc();
}

/// Record a refresh that rotated the refresh token
pub fn record_refresh_rotation() {
    TOKEN_REFRESHES_TOTAL.with_label_values(&["rotated"]).inc();
}

/// Record a blacklisted token
pub fn record_revocation(reason: &str) {
    TOKEN_REVOCATIONS_TOTAL.with_label_values(&[reason]).inc();
}

/// Record a rate limit rejection
pub fn record_rate_limited(action: &str) {
    RATE_LIMITED_TOTAL.with_label_values(&[action]).inc();
}

/// Record a background job execution
pub fn record_background_job(job_type: &str, status: &str, duration: f64) {
    BACKGROUND_JOBS_TOTAL
        .with_label_values(&[job_type, status])
        .inc();
    BACKGROUND_JOB_DURATION_SECONDS
        .with_label_values(&[job_type])
        .observe(duration);
}

/// Record rows removed by a cleanup pass
pub fn record_cleanup(table: &str, rows: u64) {
    CLEANUP_ROWS_TOTAL.with_label_values(&[table]).inc_by(rows);
}
