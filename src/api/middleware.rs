/// Request extractors and HTTP middleware
use crate::{
    context::{AppContext, RequestContext},
    error::AuthError,
    metrics::{self, HTTP_REQUESTS_ACTIVE},
    validation::{validate_request, RequestRules},
};
use axum::{
    async_trait,
    body::{self, Body},
    extract::{
        rejection::JsonRejection, ConnectInfo, FromRequest, FromRequestParts, MatchedPath, Request,
    },
    http::request::Parts,
    middleware::Next,
    response::Response,
    Json,
};
use serde::de::DeserializeOwned;
use std::{convert::Infallible, net::SocketAddr, time::Instant};

#[async_trait]
impl FromRequestParts<AppContext> for RequestContext {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        Ok(RequestContext::from_headers(
            &parts.headers,
            peer,
            state.config.service.trust_proxy_headers,
        ))
    }
}

/// JSON body that has passed its validation rules
#[derive(Debug, Clone)]
pub struct ValidatedJson<T>(pub T);

#[async_trait]
impl<T> FromRequest<AppContext> for ValidatedJson<T>
where
    T: DeserializeOwned + RequestRules + Send,
{
    type Rejection = AuthError;

    async fn from_request(req: Request, state: &AppContext) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection: JsonRejection| {
                tracing::debug!(error = %rejection.body_text(), "Malformed request body");
                AuthError::validation(rejection.body_text())
            })?;

        validate_request(&value)?;
        Ok(ValidatedJson(value))
    }
}

/// Largest body an optional JSON payload may carry
const MAX_OPTIONAL_BODY_BYTES: usize = 64 * 1024;

/// JSON body that may be omitted entirely.
///
/// An empty body yields `None`. Any other body goes through `ValidatedJson`,
/// so malformed or out-of-policy input is still rejected.
#[derive(Debug, Clone)]
pub struct OptionalValidatedJson<T>(pub Option<T>);

#[async_trait]
impl<T> FromRequest<AppContext> for OptionalValidatedJson<T>
where
    T: DeserializeOwned + RequestRules + Send,
{
    type Rejection = AuthError;

    async fn from_request(req: Request, state: &AppContext) -> Result<Self, Self::Rejection> {
        let (parts, payload) = req.into_parts();
        let bytes = body::to_bytes(payload, MAX_OPTIONAL_BODY_BYTES)
            .await
            .map_err(|e| {
                tracing::debug!(error = %e, "Unreadable request body");
                AuthError::validation("Failed to read request body")
            })?;

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(OptionalValidatedJson(None));
        }

        let req = Request::from_parts(parts, Body::from(bytes));
        let ValidatedJson(value) = ValidatedJson::<T>::from_request(req, state).await?;
        Ok(OptionalValidatedJson(Some(value)))
    }
}

/// Record request count, latency and in-flight gauge
pub async fn track_metrics(request: Request, next: Next) -> Response {
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let method = request.method().to_string();

    HTTP_REQUESTS_ACTIVE.inc();
    let start = Instant::now();
    let response = next.run(request).await;
    HTTP_REQUESTS_ACTIVE.dec();

    metrics::record_http_request(
        &method,
        &path,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );

    response
}
