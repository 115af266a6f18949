/// Auth cookies
///
/// Tokens are mirrored into cookies for same-origin browser clients. All but
/// the CSRF cookie are HttpOnly; the refresh cookie is scoped to `/auth`.
use axum::http::{
    header::{COOKIE, SET_COOKIE},
    HeaderMap, HeaderValue,
};
use chrono::{DateTime, Utc};

pub const AUTH_COOKIE: &str = "auth-token";
pub const REFRESH_COOKIE: &str = "refresh-token";
pub const SESSION_COOKIE: &str = "session-token";
pub const CSRF_COOKIE: &str = "csrf-token";

const ALL_COOKIES: [&str; 4] = [AUTH_COOKIE, REFRESH_COOKIE, SESSION_COOKIE, CSRF_COOKIE];

fn cookie_path(name: &str) -> &'static str {
    if name == REFRESH_COOKIE {
        "/auth"
    } else {
        "/"
    }
}

/// Accumulates `Set-Cookie` headers for one response
#[derive(Debug, Default)]
pub struct SetCookies {
    secure: bool,
    headers: HeaderMap,
}

impl SetCookies {
    pub fn new(secure: bool) -> Self {
        Self {
            secure,
            headers: HeaderMap::new(),
        }
    }

    /// Set a cookie that lives until `expires_at`
    pub fn set(mut self, name: &str, value: &str, expires_at: DateTime<Utc>) -> Self {
        let max_age = (expires_at - Utc::now()).num_seconds().max(0);
        let http_only = name != CSRF_COOKIE;
        self.push(format!(
            "{}={}; Path={}{}; SameSite=Lax; Max-Age={}",
            name,
            value,
            cookie_path(name),
            if http_only { "; HttpOnly" } else { "" },
            max_age
        ));
        self
    }

    /// Expire a cookie on the client
    pub fn clear(mut self, name: &str) -> Self {
        self.push(format!(
            "{}=; Path={}; HttpOnly; SameSite=Lax; Max-Age=0",
            name,
            cookie_path(name)
        ));
        self
    }

    /// Expire every auth cookie
    pub fn clear_all(self) -> Self {
        ALL_COOKIES.iter().fold(self, |jar, name| jar.clear(name))
    }

    fn push(&mut self, mut cookie: String) {
        if self.secure {
            cookie.push_str("; Secure");
        }
        match HeaderValue::from_str(&cookie) {
            Ok(value) => {
                self.headers.append(SET_COOKIE, value);
            }
            Err(e) => tracing::error!(error = %e, "Refusing to emit malformed cookie"),
        }
    }

    pub fn into_headers(self) -> HeaderMap {
        self.headers
    }
}

/// Read a cookie value from the request's `Cookie` headers
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
