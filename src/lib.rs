pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod ports;
pub mod providers;
pub mod services;
pub mod store;
pub mod validation;

use axum::{
    http::{header, HeaderValue, Method},
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::services::Reconciler;

#[derive(Clone)]
pub struct AppState {
    pub reconciler: Reconciler,
    pub config: Arc<Config>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(reconciler: Reconciler, config: Arc<Config>) -> Self {
        Self {
            reconciler,
            config,
            start_time: Instant::now(),
        }
    }
}

fn cors_layer(config: &Config) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    match config
        .frontend_origin
        .as_deref()
        .and_then(|origin| HeaderValue::from_str(origin.trim_end_matches('/')).ok())
    {
        Some(origin) => layer.allow_origin(origin),
        None => layer.allow_origin(Any),
    }
}

pub fn create_app(state: AppState) -> Router {
    let admin = Router::new()
        .route(
            "/api/retry-transaction/:reference",
            post(handlers::payments::retry_transaction),
        )
        .route_layer(axum_middleware::from_fn_with_state(
            state.config.clone(),
            middleware::admin_auth,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api-docs/openapi.json", get(handlers::openapi_json))
        .route(
            "/api/initiate-payment",
            post(handlers::payments::initiate_payment),
        )
        .route(
            "/api/verify-payment/:reference",
            get(handlers::payments::verify_payment),
        )
        .route(
            "/api/payment-callback",
            get(handlers::payments::payment_callback),
        )
        .route(
            "/api/transaction-status/:reference",
            get(handlers::payments::transaction_status),
        )
        .route("/api/check-balance", get(handlers::payments::check_balance))
        .route(
            "/api/webhooks/payment",
            post(handlers::webhook::payment_webhook),
        )
        .route(
            "/api/webhooks/fulfillment",
            post(handlers::webhook::fulfillment_webhook),
        )
        .merge(admin)
        .layer(axum_middleware::from_fn(
            middleware::request_logger_middleware,
        ))
        .layer(cors_layer(&state.config))
        .with_state(state)
}
