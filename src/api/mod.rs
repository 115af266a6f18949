/// API routes and handlers
pub mod admin;
pub mod auth;
pub mod cookies;
pub mod health;
pub mod middleware;
pub mod response;

#[cfg(test)]
mod tests;

use crate::context::AppContext;
use axum::Router;

/// Build API routes
pub fn routes(ctx: &AppContext) -> Router<AppContext> {
    Router::new()
        .merge(health::routes())
        .merge(auth::routes(ctx))
        .merge(admin::routes(ctx))
}
