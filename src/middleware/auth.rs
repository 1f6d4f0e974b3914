use axum::{
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::config::Config;
use crate::error::AppError;

/// Guards operator endpoints with `ADMIN_API_KEY`. Accepts `Bearer <key>` or the bare
/// key. Every request is refused when no key is configured.
pub async fn admin_auth<B>(
    State(config): State<Arc<Config>>,
    req: Request<B>,
    next: Next<B>,
) -> Response {
    let Some(expected) = config.admin_api_key.as_deref() else {
        tracing::warn!(path = %req.uri().path(), "Admin request refused, ADMIN_API_KEY is not set");
        return AppError::Unauthorized("Admin API is disabled".to_string()).into_response();
    };

    let authorized = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .map(|value| value.strip_prefix("Bearer ").unwrap_or(value))
        .map_or(false, |key| bool::from(key.as_bytes().ct_eq(expected.as_bytes())));

    if authorized {
        return next.run(req).await;
    }

    tracing::warn!(path = %req.uri().path(), "Rejected unauthenticated admin request");
    AppError::Unauthorized("Invalid or missing admin API key".to_string()).into_response()
}
