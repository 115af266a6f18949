/// Auth endpoints: register, login, refresh, logout, profile, session
use super::{
    cookies::{read_cookie, SetCookies, AUTH_COOKIE, CSRF_COOKIE, REFRESH_COOKIE, SESSION_COOKIE},
    middleware::{OptionalValidatedJson, ValidatedJson},
    response::ApiResponse,
};
use crate::{
    account::{
        AuthResponse, ChangePasswordRequest, LoginRequest, LogoutRequest, RefreshRequest,
        RegisterRequest, SessionInfo, TokenPair, UpdateProfileRequest, UserProfile,
    },
    auth::{AdminAuthContext, AuthContext},
    context::{AppContext, RequestContext},
    db::account::Account,
    error::{AuthError, AuthResult},
    rate_limit::{rate_limit_middleware, RateLimitAction},
    revocation::RevocationReason,
    session::{SessionBundle, SessionStats},
};
use axum::{
    extract::{Query, State},
    handler::Handler,
    http::HeaderMap,
    middleware,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};

/// Build auth routes
pub fn routes(ctx: &AppContext) -> Router<AppContext> {
    let limit = |action: RateLimitAction| {
        middleware::from_fn_with_state((ctx.clone(), action), rate_limit_middleware)
    };

    Router::new()
        .route(
            "/auth/register",
            post(register).layer(limit(RateLimitAction::Register)),
        )
        .route("/auth/login", post(login).layer(limit(RateLimitAction::Login)))
        .route(
            "/auth/refresh",
            post(refresh).layer(limit(RateLimitAction::Refresh)),
        )
        .route(
            "/auth/logout",
            post(logout.layer(limit(RateLimitAction::Logout)))
                .delete(force_logout.layer(limit(RateLimitAction::Admin))),
        )
        .route(
            "/auth/profile",
            get(get_profile).patch(update_profile.layer(limit(RateLimitAction::ProfileUpdate))),
        )
        .route("/auth/session", get(get_session))
        .route("/auth/sessions", get(list_sessions))
        .route(
            "/auth/change-password",
            post(change_password).layer(limit(RateLimitAction::ProfileUpdate)),
        )
}

fn session_cookies(secure: bool, bundle: &SessionBundle) -> HeaderMap {
    let mut jar = SetCookies::new(secure)
        .set(AUTH_COOKIE, &bundle.access.token, bundle.access.expires_at)
        .set(SESSION_COOKIE, &bundle.session_token, bundle.session.expires_at)
        .set(CSRF_COOKIE, &bundle.csrf_token, bundle.session.expires_at);
    if let Some(refresh) = &bundle.refresh {
        jar = jar.set(REFRESH_COOKIE, &refresh.token, refresh.expires_at);
    }
    jar.into_headers()
}

fn auth_response(account: &Account, bundle: &SessionBundle) -> AuthResponse {
    AuthResponse {
        user: UserProfile::from(account),
        session: SessionInfo::from(&bundle.session),
        tokens: TokenPair::new(&bundle.access, bundle.refresh.as_ref()),
        csrf_token: bundle.csrf_token.clone(),
    }
}

/// POST /auth/register
///
/// Creates the account and signs it in with a remembered session.
async fn register(
    State(ctx): State<AppContext>,
    meta: RequestContext,
    ValidatedJson(req): ValidatedJson<RegisterRequest>,
) -> AuthResult<ApiResponse<AuthResponse>> {
    let account = ctx.accounts.create_account(&req).await?;
    let bundle = ctx.sessions.create(&account, &meta, true).await?;

    let cookies = session_cookies(ctx.config.authentication.secure_cookies, &bundle);
    Ok(ApiResponse::created(auth_response(&account, &bundle)).with_headers(cookies))
}

/// POST /auth/login
async fn login(
    State(ctx): State<AppContext>,
    mut meta: RequestContext,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> AuthResult<ApiResponse<AuthResponse>> {
    if let Some(device) = &req.device_info {
        if meta.device_id.is_none() {
            meta.device_id = device.device_id.clone();
        }
        tracing::debug!(
            device_id = ?meta.device_id,
            device_name = ?device.name,
            "Login from declared device"
        );
    }

    let account = ctx.verifier.verify(&req.email, &req.password, &meta).await?;
    let bundle = ctx.sessions.create(&account, &meta, req.remember_me).await?;

    let cookies = session_cookies(ctx.config.authentication.secure_cookies, &bundle);
    Ok(ApiResponse::ok(auth_response(&account, &bundle)).with_headers(cookies))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    tokens: TokenPair,
    rotated: bool,
    session_id: String,
}

/// POST /auth/refresh
///
/// Token from the body, else from the refresh cookie.
async fn refresh(
    State(ctx): State<AppContext>,
    meta: RequestContext,
    headers: HeaderMap,
    OptionalValidatedJson(body): OptionalValidatedJson<RefreshRequest>,
) -> AuthResult<ApiResponse<RefreshResponse>> {
    let raw = body
        .and_then(|req| req.refresh_token)
        .or_else(|| read_cookie(&headers, REFRESH_COOKIE))
        .ok_or_else(|| AuthError::Unauthorized("Refresh token required".to_string()))?;

    let renewed = ctx.sessions.renew(&raw, &meta).await?;

    let mut jar = SetCookies::new(ctx.config.authentication.secure_cookies)
        .set(AUTH_COOKIE, &renewed.access.token, renewed.access.expires_at)
        .set(REFRESH_COOKIE, &renewed.refresh.token, renewed.refresh.expires_at);
    if let Some((session_token, csrf_token)) = &renewed.new_session {
        jar = jar
            .set(SESSION_COOKIE, session_token, renewed.refresh.expires_at)
            .set(CSRF_COOKIE, csrf_token, renewed.refresh.expires_at);
    }

    Ok(ApiResponse::ok(RefreshResponse {
        tokens: TokenPair::new(&renewed.access, Some(&renewed.refresh)),
        rotated: renewed.rotated,
        session_id: renewed.session_id,
    })
    .with_headers(jar.into_headers()))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LogoutResponse {
    logged_out: bool,
    all_devices: bool,
}

/// POST /auth/logout
async fn logout(
    State(ctx): State<AppContext>,
    AuthContext { auth, .. }: AuthContext,
    headers: HeaderMap,
    OptionalValidatedJson(body): OptionalValidatedJson<LogoutRequest>,
) -> AuthResult<ApiResponse<LogoutResponse>> {
    let req = body.unwrap_or_default();
    let refresh = req
        .refresh_token
        .clone()
        .or_else(|| read_cookie(&headers, REFRESH_COOKIE));

    ctx.sessions
        .sign_out(&auth, req.logout_all, refresh.as_deref())
        .await?;

    tracing::info!(
        account_id = %auth.account.id,
        session_id = %auth.session.id,
        all_devices = req.logout_all,
        reason = req.reason.as_deref().unwrap_or("user_initiated"),
        "Signed out"
    );

    let cookies = SetCookies::new(ctx.config.authentication.secure_cookies)
        .clear_all()
        .into_headers();
    Ok(ApiResponse::ok(LogoutResponse {
        logged_out: true,
        all_devices: req.logout_all,
    })
    .with_headers(cookies))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForceLogoutQuery {
    user_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ForceLogoutResponse {
    user_id: String,
    sessions_invalidated: u64,
}

/// DELETE /auth/logout?userId=
///
/// Admin-forced sign-out of every session of another account.
async fn force_logout(
    State(ctx): State<AppContext>,
    AdminAuthContext { auth }: AdminAuthContext,
    Query(query): Query<ForceLogoutQuery>,
) -> AuthResult<ApiResponse<ForceLogoutResponse>> {
    let user_id = query
        .user_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| AuthError::validation("userId query parameter is required"))?;

    let target = ctx.accounts.get_account(&user_id).await?;
    let sessions_invalidated = ctx.sessions.invalidate_all(&target.id).await?;

    tracing::warn!(
        admin_id = %auth.account.id,
        account_id = %target.id,
        reason = RevocationReason::AdminForcedLogout.as_str(),
        sessions_invalidated,
        "Forced sign-out"
    );

    Ok(ApiResponse::ok(ForceLogoutResponse {
        user_id: target.id,
        sessions_invalidated,
    }))
}

#[derive(Debug, Serialize)]
struct ProfileResponse {
    user: UserProfile,
}

/// GET /auth/profile
async fn get_profile(AuthContext { auth, .. }: AuthContext) -> ApiResponse<ProfileResponse> {
    ApiResponse::ok(ProfileResponse {
        user: UserProfile::from(&auth.account),
    })
}

/// PATCH /auth/profile
async fn update_profile(
    State(ctx): State<AppContext>,
    AuthContext { auth, .. }: AuthContext,
    ValidatedJson(req): ValidatedJson<UpdateProfileRequest>,
) -> AuthResult<ApiResponse<ProfileResponse>> {
    let account = ctx
        .accounts
        .update_username(&auth.account.id, &req.username)
        .await?;

    Ok(ApiResponse::ok(ProfileResponse {
        user: UserProfile::from(&account),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    user: UserProfile,
    session: SessionInfo,
    stats: SessionStats,
}

/// GET /auth/session
async fn get_session(
    State(ctx): State<AppContext>,
    AuthContext { auth, .. }: AuthContext,
) -> AuthResult<ApiResponse<SessionResponse>> {
    let stats = ctx.sessions.stats(&auth.account.id).await?;

    Ok(ApiResponse::ok(SessionResponse {
        user: UserProfile::from(&auth.account),
        session: SessionInfo::from(&auth.session),
        stats,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionListResponse {
    current_session_id: String,
    sessions: Vec<SessionInfo>,
}

/// GET /auth/sessions
async fn list_sessions(
    State(ctx): State<AppContext>,
    AuthContext { auth, .. }: AuthContext,
) -> AuthResult<ApiResponse<SessionListResponse>> {
    let sessions = ctx.sessions.list_active(&auth.account.id).await?;

    Ok(ApiResponse::ok(SessionListResponse {
        current_session_id: auth.session.id.clone(),
        sessions: sessions.iter().map(SessionInfo::from).collect(),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChangePasswordResponse {
    password_changed: bool,
    sessions_invalidated: u64,
}

/// POST /auth/change-password
///
/// Signs the account out everywhere on success.
async fn change_password(
    State(ctx): State<AppContext>,
    AuthContext { auth, .. }: AuthContext,
    ValidatedJson(req): ValidatedJson<ChangePasswordRequest>,
) -> AuthResult<ApiResponse<ChangePasswordResponse>> {
    ctx.accounts
        .change_password(&auth.account.id, &req.current_password, &req.new_password)
        .await?;

    let sessions_invalidated = ctx.sessions.invalidate_all(&auth.account.id).await?;
    ctx.sessions
        .blacklist_access(&auth, RevocationReason::PasswordChange)
        .await?;

    let cookies = SetCookies::new(ctx.config.authentication.secure_cookies)
        .clear_all()
        .into_headers();
    Ok(ApiResponse::ok(ChangePasswordResponse {
        password_changed: true,
        sessions_invalidated,
    })
    .with_headers(cookies))
}
