pub mod payments;
pub mod webhook;

use crate::health::{check_health, CircuitBreakers, HealthResponse, StoreHealth};
use crate::AppState;
use axum::{extract::State, response::IntoResponse, Json};
use utoipa::OpenApi;

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up; status is degraded while a provider circuit is open", body = HealthResponse)
    ),
    tag = "Health"
)]
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(check_health(&state.reconciler, state.start_time).await)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        payments::initiate_payment,
        payments::verify_payment,
        payments::payment_callback,
        payments::transaction_status,
        payments::retry_transaction,
        payments::check_balance,
        webhook::payment_webhook,
        webhook::fulfillment_webhook,
    ),
    components(schemas(
        HealthResponse,
        StoreHealth,
        CircuitBreakers,
        crate::validation::PurchaseRequest,
        payments::TransactionView,
        webhook::DeliveryReport,
        crate::domain::Phase,
        crate::domain::FailureCode,
    )),
    tags(
        (name = "Payments", description = "Checkout, verification and status"),
        (name = "Admin", description = "Operator endpoints"),
        (name = "Webhooks", description = "Provider notifications"),
        (name = "Health", description = "Liveness")
    )
)]
pub struct ApiDoc;

pub async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}
