//! Router-level scenarios driven through the full middleware stack

use crate::{
    config::ServerConfig,
    context::AppContext,
    server::build_router,
    test_support::{test_config, test_context},
};
use axum::{
    body::Body,
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

const PASSWORD: &str = "Sup3r$ecret!";

struct TestApp {
    router: Router,
    ctx: AppContext,
}

struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Value,
}

impl Response {
    fn rate_limit(&self) -> Option<&str> {
        self.headers
            .get("x-ratelimit-limit")
            .and_then(|v| v.to_str().ok())
    }

    fn set_cookie(&self, name: &str) -> Option<String> {
        self.headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|c| c.split(';').next())
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, value)| *key == name && !value.is_empty())
            .map(|(_, value)| value.to_string())
    }

    fn access_token(&self) -> String {
        self.body["data"]["tokens"]["accessToken"]
            .as_str()
            .expect("access token")
            .to_string()
    }
}

async fn app_with(config: ServerConfig) -> TestApp {
    let ctx = test_context(config).await;
    TestApp {
        router: build_router(ctx.clone()),
        ctx,
    }
}

async fn app() -> TestApp {
    app_with(test_config()).await
}

impl TestApp {
    async fn send(&self, request: Request<Body>) -> Response {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };

        Response {
            status,
            headers,
            body,
        }
    }

    async fn call(&self, method: Method, uri: &str, body: Option<Value>, bearer: Option<&str>) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        };
        self.send(request.unwrap()).await
    }

    async fn register(&self, email: &str, username: &str) -> Response {
        self.call(
            Method::POST,
            "/auth/register",
            Some(json!({
                "email": email,
                "username": username,
                "password": PASSWORD,
                "confirmPassword": PASSWORD,
                "acceptTerms": true,
            })),
            None,
        )
        .await
    }

    async fn login(&self, email: &str, password: &str) -> Response {
        self.call(
            Method::POST,
            "/auth/login",
            Some(json!({ "email": email, "password": password, "rememberMe": true })),
            None,
        )
        .await
    }

    async fn login_from(&self, forwarded_for: &str) -> Response {
        self.send(
            Request::builder()
                .method(Method::POST)
                .uri("/auth/login")
                .header(header::CONTENT_TYPE, "application/json")
                .header("x-forwarded-for", forwarded_for)
                .body(Body::from(
                    json!({ "email": "nobody@example.com", "password": PASSWORD }).to_string(),
                ))
                .unwrap(),
        )
        .await
    }

    async fn make_admin(&self, account_id: &str) {
        sqlx::query("UPDATE account SET role = 'admin' WHERE id = ?1")
            .bind(account_id)
            .execute(&self.ctx.db)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_register_signs_in_and_rejects_duplicates() {
    let app = app().await;

    let res = app.register("Alice@Example.com", "alice").await;
    assert_eq!(res.status, StatusCode::CREATED);
    assert_eq!(res.body["success"], true);
    assert_eq!(res.body["data"]["user"]["email"], "alice@example.com");
    assert_eq!(res.body["data"]["user"]["role"], "user");
    assert!(res.body["data"]["user"].get("passwordHash").is_none());
    assert!(res.body["data"]["tokens"]["refreshToken"].is_string());
    assert!(res.set_cookie("auth-token").is_some());
    assert!(res.set_cookie("refresh-token").is_some());
    assert_eq!(
        res.set_cookie("csrf-token").as_deref(),
        res.body["data"]["csrfToken"].as_str()
    );

    let dup = app.register("alice@example.com", "alice2").await;
    assert_eq!(dup.status, StatusCode::CONFLICT);
    assert_eq!(dup.body["success"], false);
    assert_eq!(dup.body["error"]["code"], "CONFLICT");
}

#[tokio::test]
async fn test_validation_errors_list_fields() {
    let app = app().await;

    let res = app
        .call(
            Method::POST,
            "/auth/register",
            Some(json!({
                "email": "not-an-email",
                "username": "ok_name",
                "password": "weak",
                "confirmPassword": "different",
                "acceptTerms": false,
            })),
            None,
        )
        .await;

    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.body["error"]["code"], "VALIDATION_ERROR");
    let fields: Vec<&str> = res.body["error"]["details"]["fields"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|f| f["field"].as_str())
        .collect();
    for expected in ["acceptTerms", "confirmPassword", "email", "password"] {
        assert!(fields.contains(&expected), "missing {} in {:?}", expected, fields);
    }

    let malformed = app
        .send(
            Request::builder()
                .method(Method::POST)
                .uri("/auth/login")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await;
    assert_eq!(malformed.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_lockout_after_repeated_failures() {
    let app = app().await;
    app.register("bob@example.com", "bob").await;

    for attempt in 1..=4 {
        let res = app.login("bob@example.com", "Wrong#Pass1").await;
        assert_eq!(res.status, StatusCode::UNAUTHORIZED, "attempt {}", attempt);
        assert_eq!(res.body["error"]["code"], "INVALID_CREDENTIALS");
    }

    let fifth = app.login("bob@example.com", "Wrong#Pass1").await;
    assert_eq!(fifth.status, StatusCode::FORBIDDEN);
    assert_eq!(fifth.body["error"]["code"], "ACCOUNT_LOCKED");
    assert!(fifth.body["error"]["details"]["lockedUntil"].is_string());

    // Correct password is still refused while locked
    let sixth = app.login("bob@example.com", PASSWORD).await;
    assert_eq!(sixth.status, StatusCode::FORBIDDEN);
    assert_eq!(sixth.body["error"]["code"], "ACCOUNT_LOCKED");
}

#[tokio::test]
async fn test_unknown_account_and_wrong_password_look_alike() {
    let app = app().await;
    app.register("carol@example.com", "carol").await;

    let unknown = app.login("nobody@example.com", PASSWORD).await;
    let wrong = app.login("carol@example.com", "Wrong#Pass1").await;

    assert_eq!(unknown.status, wrong.status);
    assert_eq!(unknown.body["error"], wrong.body["error"]);
}

#[tokio::test]
async fn test_refresh_rotates_and_old_token_is_rejected() {
    let mut config = test_config();
    // Always inside the rotation window
    config.authentication.refresh_rotation_threshold_secs =
        config.authentication.refresh_token_ttl_secs + 60;
    let app = app_with(config).await;

    let registered = app.register("dave@example.com", "dave").await;
    let original = registered.body["data"]["tokens"]["refreshToken"]
        .as_str()
        .unwrap()
        .to_string();

    let res = app
        .call(
            Method::POST,
            "/auth/refresh",
            Some(json!({ "refreshToken": original })),
            None,
        )
        .await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["data"]["rotated"], true);
    let rotated = res.body["data"]["tokens"]["refreshToken"].as_str().unwrap();
    assert_ne!(rotated, original);
    assert!(res.set_cookie("refresh-token").is_some());

    let profile = app
        .call(Method::GET, "/auth/profile", None, Some(&res.access_token()))
        .await;
    assert_eq!(profile.status, StatusCode::OK);

    let reused = app
        .call(
            Method::POST,
            "/auth/refresh",
            Some(json!({ "refreshToken": original })),
            None,
        )
        .await;
    assert_eq!(reused.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_refresh_reads_cookie_and_requires_a_token() {
    let app = app().await;
    let registered = app.register("erin@example.com", "erin").await;
    let cookie = registered.set_cookie("refresh-token").unwrap();

    let res = app
        .send(
            Request::builder()
                .method(Method::POST)
                .uri("/auth/refresh")
                .header(header::COOKIE, format!("refresh-token={}", cookie))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["data"]["rotated"], false);

    let missing = app.call(Method::POST, "/auth/refresh", None, None).await;
    assert_eq!(missing.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_logout_revokes_access_token() {
    let app = app().await;
    let token = app.register("frank@example.com", "frank").await.access_token();

    let before = app.call(Method::GET, "/auth/profile", None, Some(&token)).await;
    assert_eq!(before.status, StatusCode::OK);
    assert_eq!(before.body["data"]["user"]["username"], "frank");

    let logout = app.call(Method::POST, "/auth/logout", None, Some(&token)).await;
    assert_eq!(logout.status, StatusCode::OK);
    assert_eq!(logout.rate_limit(), Some("30"));
    assert_eq!(logout.body["data"]["loggedOut"], true);
    assert_eq!(
        logout.headers.get_all(header::SET_COOKIE).iter().count(),
        4,
        "all auth cookies cleared"
    );

    let after = app.call(Method::GET, "/auth/profile", None, Some(&token)).await;
    assert_eq!(after.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_logout_all_ends_every_session() {
    let app = app().await;
    let first = app.register("gina@example.com", "gina").await.access_token();
    let second = app.login("gina@example.com", PASSWORD).await.access_token();

    let res = app
        .call(
            Method::POST,
            "/auth/logout",
            Some(json!({ "logoutAll": true })),
            Some(&first),
        )
        .await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["data"]["allDevices"], true);

    let other = app.call(Method::GET, "/auth/session", None, Some(&second)).await;
    assert_eq!(other.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_session_introspection() {
    let app = app().await;
    let token = app.register("hank@example.com", "hank").await.access_token();

    let res = app.call(Method::GET, "/auth/session", None, Some(&token)).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["data"]["stats"]["activeSessionCount"], 1);
    assert_eq!(res.body["data"]["stats"]["activeRefreshTokenCount"], 1);
    assert_eq!(res.body["data"]["session"]["rememberMe"], true);

    let list = app.call(Method::GET, "/auth/sessions", None, Some(&token)).await;
    assert_eq!(list.status, StatusCode::OK);
    assert_eq!(list.body["data"]["sessions"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrent_password_changes_admit_one_winner() {
    let app = app().await;
    let token = app.register("ivy@example.com", "ivy").await.access_token();

    let requests = (0..5).map(|i| {
        let new_password = format!("N3w$ecret{}", i);
        app.call(
            Method::POST,
            "/auth/change-password",
            Some(json!({
                "currentPassword": PASSWORD,
                "newPassword": new_password,
                "confirmPassword": new_password,
            })),
            Some(&token),
        )
    });
    let results = futures::future::join_all(requests).await;

    let winners = results.iter().filter(|r| r.status == StatusCode::OK).count();
    assert_eq!(winners, 1);
    for res in results.iter().filter(|r| r.status != StatusCode::OK) {
        assert!(
            matches!(res.status, StatusCode::CONFLICT | StatusCode::UNAUTHORIZED),
            "unexpected status {}",
            res.status
        );
    }

    // Every session was ended by the winning change
    let after = app.call(Method::GET, "/auth/profile", None, Some(&token)).await;
    assert_eq!(after.status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        app.login("ivy@example.com", PASSWORD).await.status,
        StatusCode::UNAUTHORIZED
    );
}

#[tokio::test]
async fn test_cookie_auth_requires_csrf_header_for_mutations() {
    let app = app().await;
    let registered = app.register("jack@example.com", "jack").await;
    let auth_cookie = registered.set_cookie("auth-token").unwrap();
    let csrf = registered.set_cookie("csrf-token").unwrap();
    let cookie = format!("auth-token={}; csrf-token={}", auth_cookie, csrf);

    let read = app
        .send(
            Request::builder()
                .method(Method::GET)
                .uri("/auth/profile")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(read.status, StatusCode::OK);

    let patch = |csrf_header: Option<&str>| {
        let mut builder = Request::builder()
            .method(Method::PATCH)
            .uri("/auth/profile")
            .header(header::COOKIE, &cookie)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(value) = csrf_header {
            builder = builder.header("x-csrf-token", value);
        }
        builder
            .body(Body::from(json!({ "username": "jack_renamed" }).to_string()))
            .unwrap()
    };

    let forged = app.send(patch(None)).await;
    assert_eq!(forged.status, StatusCode::FORBIDDEN);

    let wrong = app.send(patch(Some("not-the-token"))).await;
    assert_eq!(wrong.status, StatusCode::FORBIDDEN);

    let ok = app.send(patch(Some(csrf.as_str()))).await;
    assert_eq!(ok.status, StatusCode::OK);
    assert_eq!(ok.body["data"]["user"]["username"], "jack_renamed");
}

#[tokio::test]
async fn test_admin_routes_require_admin_role() {
    let app = app().await;
    let admin = app.register("kate@example.com", "kate").await;
    let admin_token = admin.access_token();
    let target = app.register("liam@example.com", "liam").await;
    let target_id = target.body["data"]["user"]["id"].as_str().unwrap().to_string();
    let target_token = target.access_token();

    let denied = app.call(Method::GET, "/admin/users", None, Some(&admin_token)).await;
    assert_eq!(denied.status, StatusCode::FORBIDDEN);

    app.make_admin(admin.body["data"]["user"]["id"].as_str().unwrap())
        .await;

    let list = app.call(Method::GET, "/admin/users?limit=1", None, Some(&admin_token)).await;
    assert_eq!(list.status, StatusCode::OK);
    assert_eq!(list.body["data"]["users"].as_array().unwrap().len(), 1);
    let cursor = list.body["data"]["cursor"].as_str().unwrap().to_string();

    let next = app
        .call(
            Method::GET,
            &format!("/admin/users?limit=1&cursor={}", cursor),
            None,
            Some(&admin_token),
        )
        .await;
    assert_eq!(next.status, StatusCode::OK);
    assert_eq!(next.body["data"]["users"][0]["id"], target_id.as_str());

    let lock = app
        .call(
            Method::POST,
            &format!("/admin/users/{}/lock", target_id),
            Some(json!({ "durationMinutes": 60 })),
            Some(&admin_token),
        )
        .await;
    assert_eq!(lock.status, StatusCode::OK);
    assert_eq!(lock.body["data"]["user"]["isLocked"], true);

    let kicked = app.call(Method::GET, "/auth/profile", None, Some(&target_token)).await;
    assert_eq!(kicked.status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        app.login("liam@example.com", PASSWORD).await.status,
        StatusCode::FORBIDDEN
    );

    let attempts = app
        .call(
            Method::GET,
            &format!("/admin/users/{}/login-attempts", target_id),
            None,
            Some(&admin_token),
        )
        .await;
    assert_eq!(attempts.status, StatusCode::OK);
    assert!(!attempts.body["data"]["attempts"].as_array().unwrap().is_empty());

    let unlock = app
        .call(
            Method::POST,
            &format!("/admin/users/{}/unlock", target_id),
            None,
            Some(&admin_token),
        )
        .await;
    assert_eq!(unlock.status, StatusCode::OK);
    assert_eq!(
        app.login("liam@example.com", PASSWORD).await.status,
        StatusCode::OK
    );

    let missing = app
        .call(Method::GET, "/admin/users/does-not-exist", None, Some(&admin_token))
        .await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_forced_logout() {
    let app = app().await;
    let admin = app.register("mia@example.com", "mia").await;
    let admin_token = admin.access_token();
    let target = app.register("noah@example.com", "noah").await;
    let target_id = target.body["data"]["user"]["id"].as_str().unwrap().to_string();

    let denied = app
        .call(
            Method::DELETE,
            &format!("/auth/logout?userId={}", target_id),
            None,
            Some(&target.access_token()),
        )
        .await;
    assert_eq!(denied.status, StatusCode::FORBIDDEN);

    app.make_admin(admin.body["data"]["user"]["id"].as_str().unwrap())
        .await;

    let res = app
        .call(
            Method::DELETE,
            &format!("/auth/logout?userId={}", target_id),
            None,
            Some(&admin_token),
        )
        .await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["data"]["sessionsInvalidated"], 1);
    // Counted against the admin budget, not the logout one
    assert_eq!(res.rate_limit(), Some("100"));

    let kicked = app
        .call(Method::GET, "/auth/profile", None, Some(&target.access_token()))
        .await;
    assert_eq!(kicked.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_invalid_optional_bodies_are_rejected() {
    let app = app().await;
    let admin = app.register("olga@example.com", "olga").await;
    let admin_token = admin.access_token();
    app.make_admin(admin.body["data"]["user"]["id"].as_str().unwrap())
        .await;
    let target = app.register("paul@example.com", "paul").await;
    let target_id = target.body["data"]["user"]["id"].as_str().unwrap().to_string();
    let lock_uri = format!("/admin/users/{}/lock", target_id);

    let zero = app
        .call(
            Method::POST,
            &lock_uri,
            Some(json!({ "durationMinutes": 0 })),
            Some(&admin_token),
        )
        .await;
    assert_eq!(zero.status, StatusCode::BAD_REQUEST);
    assert_eq!(zero.body["error"]["code"], "VALIDATION_ERROR");

    let user = app
        .call(
            Method::GET,
            &format!("/admin/users/{}", target_id),
            None,
            Some(&admin_token),
        )
        .await;
    assert_eq!(user.body["data"]["user"]["isLocked"], false);

    let bad_logout = app
        .call(
            Method::POST,
            "/auth/logout",
            Some(json!({ "logoutAll": "yes" })),
            Some(&target.access_token()),
        )
        .await;
    assert_eq!(bad_logout.status, StatusCode::BAD_REQUEST);
    let still_in = app
        .call(Method::GET, "/auth/profile", None, Some(&target.access_token()))
        .await;
    assert_eq!(still_in.status, StatusCode::OK);

    // No body at all means the defaults: an open-ended lock
    let indefinite = app.call(Method::POST, &lock_uri, None, Some(&admin_token)).await;
    assert_eq!(indefinite.status, StatusCode::OK);
    assert_eq!(indefinite.body["data"]["user"]["isLocked"], true);
}

#[tokio::test]
async fn test_forwarded_for_is_not_a_rate_limit_key_by_default() {
    let app = app().await;

    for i in 0..10 {
        let res = app.login_from(&format!("203.0.113.{}", i)).await;
        assert_eq!(res.status, StatusCode::UNAUTHORIZED, "attempt {}", i);
    }

    let limited = app.login_from("203.0.113.250").await;
    assert_eq!(limited.status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_forwarded_for_keys_requests_behind_trusted_proxy() {
    let mut config = test_config();
    config.service.trust_proxy_headers = true;
    let app = app_with(config).await;

    for i in 0..15 {
        let res = app.login_from(&format!("203.0.113.{}", i)).await;
        assert_eq!(res.status, StatusCode::UNAUTHORIZED, "attempt {}", i);
    }
}

#[tokio::test]
async fn test_registration_is_rate_limited() {
    let app = app().await;
    let body = json!({ "email": "bad" });

    for _ in 0..5 {
        let res = app.call(Method::POST, "/auth/register", Some(body.clone()), None).await;
        assert_eq!(res.status, StatusCode::BAD_REQUEST);
        assert!(res.headers.contains_key("x-ratelimit-remaining"));
    }

    let limited = app.call(Method::POST, "/auth/register", Some(body), None).await;
    assert_eq!(limited.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(limited.body["error"]["code"], "RATE_LIMITED");
    assert!(limited.headers.contains_key(header::RETRY_AFTER));
}

#[tokio::test]
async fn test_health_metrics_and_fallback() {
    let app = app().await;

    let health = app.call(Method::GET, "/health", None, None).await;
    assert_eq!(health.status, StatusCode::OK);
    assert_eq!(health.body["status"], "healthy");

    app.call(Method::GET, "/health", None, None).await;
    let metrics = app.call(Method::GET, "/metrics", None, None).await;
    assert_eq!(metrics.status, StatusCode::OK);
    assert!(metrics.body.as_str().unwrap().contains("gatehouse_http_requests_total"));

    let missing = app.call(Method::GET, "/nope", None, None).await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    assert_eq!(missing.body["error"]["code"], "NOT_FOUND");
}
