/// Admin API Endpoints
/// Account inspection, locking and role management
use super::{
    middleware::{OptionalValidatedJson, ValidatedJson},
    response::ApiResponse,
};
use crate::{
    account::{LockAccountRequest, UpdateRoleRequest, UserProfile},
    auth::AdminAuthContext,
    context::AppContext,
    db::account::LoginAttempt,
    error::{AuthError, AuthResult},
    rate_limit::{rate_limit_middleware, RateLimitAction},
    session::SessionStats,
};
use axum::{
    extract::{Path, Query, State},
    middleware,
    routing::{get, post, put},
    Router,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

const DEFAULT_PAGE_SIZE: i64 = 50;
const DEFAULT_ATTEMPT_LIMIT: i64 = 50;

/// Build admin API routes
pub fn routes(ctx: &AppContext) -> Router<AppContext> {
    Router::new()
        .route("/admin/users", get(list_users))
        .route("/admin/users/:id", get(get_user))
        .route("/admin/users/:id/lock", post(lock_user))
        .route("/admin/users/:id/unlock", post(unlock_user))
        .route("/admin/users/:id/role", put(update_role))
        .route("/admin/users/:id/login-attempts", get(login_attempts))
        .route_layer(middleware::from_fn_with_state(
            (ctx.clone(), RateLimitAction::Admin),
            rate_limit_middleware,
        ))
}

#[derive(Debug, Deserialize)]
struct ListUsersQuery {
    limit: Option<i64>,
    cursor: Option<String>,
}

#[derive(Debug, Serialize)]
struct ListUsersResponse {
    users: Vec<UserProfile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<String>,
}

/// GET /admin/users
async fn list_users(
    State(ctx): State<AppContext>,
    _admin: AdminAuthContext,
    Query(query): Query<ListUsersQuery>,
) -> AuthResult<ApiResponse<ListUsersResponse>> {
    let page = ctx
        .accounts
        .list_accounts(
            query.limit.unwrap_or(DEFAULT_PAGE_SIZE),
            query.cursor.as_deref(),
        )
        .await?;

    Ok(ApiResponse::ok(ListUsersResponse {
        users: page.accounts.iter().map(UserProfile::from).collect(),
        cursor: page.cursor,
    }))
}

#[derive(Debug, Serialize)]
struct UserDetailResponse {
    user: UserProfile,
    stats: SessionStats,
}

/// GET /admin/users/:id
async fn get_user(
    State(ctx): State<AppContext>,
    _admin: AdminAuthContext,
    Path(id): Path<String>,
) -> AuthResult<ApiResponse<UserDetailResponse>> {
    let account = ctx.accounts.get_account(&id).await?;
    let stats = ctx.sessions.stats(&account.id).await?;

    Ok(ApiResponse::ok(UserDetailResponse {
        user: UserProfile::from(&account),
        stats,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LockResponse {
    user: UserProfile,
    sessions_invalidated: u64,
}

/// POST /admin/users/:id/lock
///
/// Locks the account and ends all of its sessions.
async fn lock_user(
    State(ctx): State<AppContext>,
    AdminAuthContext { auth }: AdminAuthContext,
    Path(id): Path<String>,
    OptionalValidatedJson(body): OptionalValidatedJson<LockAccountRequest>,
) -> AuthResult<ApiResponse<LockResponse>> {
    if id == auth.account.id {
        return Err(AuthError::Forbidden(
            "Admins cannot lock their own account".to_string(),
        ));
    }

    let req = body.unwrap_or_default();
    let until = req
        .duration_minutes
        .map(|minutes| Utc::now() + Duration::minutes(minutes));

    let account = ctx.accounts.lock_account(&id, until).await?;
    let sessions_invalidated = ctx.sessions.invalidate_all(&account.id).await?;

    tracing::warn!(
        admin_id = %auth.account.id,
        account_id = %account.id,
        locked_until = ?until,
        reason = req.reason.as_deref().unwrap_or("unspecified"),
        sessions_invalidated,
        "Admin locked account"
    );

    Ok(ApiResponse::ok(LockResponse {
        user: UserProfile::from(&account),
        sessions_invalidated,
    }))
}

#[derive(Debug, Serialize)]
struct UserResponse {
    user: UserProfile,
}

/// POST /admin/users/:id/unlock
async fn unlock_user(
    State(ctx): State<AppContext>,
    AdminAuthContext { auth }: AdminAuthContext,
    Path(id): Path<String>,
) -> AuthResult<ApiResponse<UserResponse>> {
    let account = ctx.accounts.unlock_account(&id).await?;

    tracing::info!(admin_id = %auth.account.id, account_id = %account.id, "Admin unlocked account");

    Ok(ApiResponse::ok(UserResponse {
        user: UserProfile::from(&account),
    }))
}

/// PUT /admin/users/:id/role
async fn update_role(
    State(ctx): State<AppContext>,
    AdminAuthContext { auth }: AdminAuthContext,
    Path(id): Path<String>,
    ValidatedJson(req): ValidatedJson<UpdateRoleRequest>,
) -> AuthResult<ApiResponse<UserResponse>> {
    if id == auth.account.id && req.role != auth.account.role {
        return Err(AuthError::Forbidden(
            "Admins cannot change their own role".to_string(),
        ));
    }

    let account = ctx.accounts.set_role(&id, req.role).await?;

    Ok(ApiResponse::ok(UserResponse {
        user: UserProfile::from(&account),
    }))
}

#[derive(Debug, Deserialize)]
struct AttemptsQuery {
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct AttemptsResponse {
    attempts: Vec<LoginAttempt>,
}

/// GET /admin/users/:id/login-attempts
async fn login_attempts(
    State(ctx): State<AppContext>,
    _admin: AdminAuthContext,
    Path(id): Path<String>,
    Query(query): Query<AttemptsQuery>,
) -> AuthResult<ApiResponse<AttemptsResponse>> {
    let attempts = ctx
        .accounts
        .login_attempts(&id, query.limit.unwrap_or(DEFAULT_ATTEMPT_LIMIT))
        .await?;

    Ok(ApiResponse::ok(AttemptsResponse { attempts }))
}
