use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use utoipa::{IntoParams, ToSchema};

use crate::domain::{is_valid_reference, FailureCode, Phase, TransactionRecord};
use crate::error::AppError;
use crate::services::ReconcileOutcome;
use crate::validation::{validate_purchase, PurchaseRequest};
use crate::AppState;

/// Read-only view of a transaction record.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransactionView {
    pub reference: String,
    pub phase: Phase,
    pub payment_status: String,
    pub fulfillment_status: String,
    pub product_code: String,
    pub target_contact: String,
    pub volume_mb: u32,
    pub amount: f64,
    pub provider_payment_id: Option<String>,
    pub transaction_id: Option<String>,
    pub attempt_count: u32,
    pub error: Option<String>,
    pub error_code: Option<FailureCode>,
    pub delivery_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl From<&TransactionRecord> for TransactionView {
    fn from(record: &TransactionRecord) -> Self {
        let intent = &record.request_payload;
        Self {
            reference: record.reference.clone(),
            phase: record.phase,
            payment_status: payment_status(record.phase).to_string(),
            fulfillment_status: fulfillment_status(record.phase).to_string(),
            product_code: intent.product_code.clone(),
            target_contact: intent.target_contact.clone(),
            volume_mb: intent.volume_mb,
            amount: intent.amount_minor as f64 / 100.0,
            provider_payment_id: record.provider_payment_id.clone(),
            transaction_id: record
                .fulfillment_response()
                .map(|receipt| receipt.provider_transaction_id.clone()),
            attempt_count: record.attempt_count,
            error: record.error.clone(),
            error_code: record.error_code,
            delivery_status: record.delivery_status.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            last_attempt_at: record.last_attempt_at,
        }
    }
}

fn payment_status(phase: Phase) -> &'static str {
    match phase {
        Phase::Initiated | Phase::AwaitingPayment => "pending",
        Phase::PaymentFailed => "failed",
        _ => "success",
    }
}

fn fulfillment_status(phase: Phase) -> &'static str {
    match phase {
        Phase::Fulfilled => "success",
        Phase::FulfillmentFailed => "failed",
        Phase::Fulfilling => "processing",
        _ => "not_started",
    }
}

/// Client-facing rendering of a reconciliation outcome. Fulfilled outcomes render
/// identically on every call.
pub fn outcome_response(outcome: ReconcileOutcome) -> (StatusCode, Json<Value>) {
    match outcome {
        ReconcileOutcome::Fulfilled { reference, receipt } => (
            StatusCode::OK,
            Json(json!({
                "status": "success",
                "message": "Payment verified and bundle delivered",
                "data": {
                    "reference": reference,
                    "transaction_id": receipt.provider_transaction_id,
                    "fulfilledAt": receipt.fulfilled_at,
                    "fulfillment": receipt.raw,
                },
            })),
        ),
        ReconcileOutcome::Pending {
            reference,
            gateway_status,
        } => (
            StatusCode::OK,
            Json(json!({
                "status": "pending",
                "message": "Payment has not been confirmed yet",
                "data": {
                    "reference": reference,
                    "paymentStatus": "pending",
                    "gatewayStatus": gateway_status,
                },
            })),
        ),
        ReconcileOutcome::PaymentFailed {
            reference,
            code,
            reason,
        } => (
            StatusCode::OK,
            Json(json!({
                "status": "failed",
                "message": reason,
                "data": {
                    "reference": reference,
                    "paymentStatus": "failed",
                    "code": code,
                },
            })),
        ),
        ReconcileOutcome::FulfillmentPending {
            reference,
            code,
            reason,
        } => (
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "pending",
                "paymentStatus": "success",
                "fulfillmentStatus": "failed",
                "message": "Payment received. Bundle delivery is pending and will be retried",
                "data": {
                    "reference": reference,
                    "code": code,
                    "reason": reason,
                },
            })),
        ),
    }
}

fn checked_reference(reference: &str) -> Result<&str, AppError> {
    let reference = reference.trim();
    if !is_valid_reference(reference) {
        return Err(AppError::Validation(format!(
            "reference: '{}' is not a valid transaction reference",
            reference
        )));
    }
    Ok(reference)
}

#[utoipa::path(
    post,
    path = "/api/initiate-payment",
    request_body = PurchaseRequest,
    responses(
        (status = 200, description = "Checkout created"),
        (status = 400, description = "Invalid purchase request"),
        (status = 502, description = "Payment gateway rejected the request"),
        (status = 503, description = "Payment gateway unavailable")
    ),
    tag = "Payments"
)]
pub async fn initiate_payment(
    State(state): State<AppState>,
    payload: Result<Json<PurchaseRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(request) = payload.map_err(|e| AppError::Validation(e.body_text()))?;
    let (intent, product) = validate_purchase(&request)?;

    let initiated = state
        .reconciler
        .initiate(intent, product.reference_prefix)
        .await?;

    Ok(Json(json!({
        "status": "success",
        "data": {
            "reference": initiated.reference,
            "authorizationUrl": initiated.authorization_url,
        },
    })))
}

#[utoipa::path(
    get,
    path = "/api/verify-payment/{reference}",
    params(("reference" = String, Path, description = "Transaction reference")),
    responses(
        (status = 200, description = "Fulfilled, pending or failed"),
        (status = 202, description = "Payment succeeded, fulfillment pending"),
        (status = 404, description = "Unknown reference")
    ),
    tag = "Payments"
)]
pub async fn verify_payment(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let reference = checked_reference(&reference)?;
    let outcome = state.reconciler.verify_and_fulfill(reference).await?;
    Ok(outcome_response(outcome))
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct CallbackQuery {
    pub reference: Option<String>,
    pub trxref: Option<String>,
}

/// Browser landing point after the hosted checkout.
#[utoipa::path(
    get,
    path = "/api/payment-callback",
    params(CallbackQuery),
    responses((status = 303, description = "Redirect to the result page")),
    tag = "Payments"
)]
pub async fn payment_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Redirect {
    let base = state.config.frontend_base_url().to_string();
    let Some(reference) = query
        .reference
        .or(query.trxref)
        .filter(|r| is_valid_reference(r.trim()))
    else {
        return Redirect::to(&format!("{}/payment-failed.html", base));
    };
    let reference = reference.trim();

    let page = match state.reconciler.verify_and_fulfill(reference).await {
        Ok(ReconcileOutcome::Fulfilled { .. }) => "payment-success.html",
        Ok(ReconcileOutcome::Pending { .. }) | Ok(ReconcileOutcome::FulfillmentPending { .. }) => {
            "payment-pending.html"
        }
        Ok(ReconcileOutcome::PaymentFailed { .. }) => "payment-failed.html",
        Err(e) => {
            tracing::error!(reference = %reference, error = %e, "Payment callback verification failed");
            "payment-pending.html"
        }
    };

    Redirect::to(&format!("{}/{}?reference={}", base, page, reference))
}

#[utoipa::path(
    get,
    path = "/api/transaction-status/{reference}",
    params(("reference" = String, Path, description = "Transaction reference")),
    responses(
        (status = 200, description = "Current transaction state", body = TransactionView),
        (status = 404, description = "Unknown reference")
    ),
    tag = "Payments"
)]
pub async fn transaction_status(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let reference = checked_reference(&reference)?;
    let record = state.reconciler.transaction_status(reference).await?;

    Ok(Json(json!({
        "status": "success",
        "data": TransactionView::from(&record),
    })))
}

#[utoipa::path(
    post,
    path = "/api/retry-transaction/{reference}",
    params(("reference" = String, Path, description = "Transaction reference")),
    responses(
        (status = 200, description = "Fulfilled, pending or failed"),
        (status = 202, description = "Fulfillment failed again"),
        (status = 401, description = "Missing or invalid admin key"),
        (status = 404, description = "Unknown reference")
    ),
    tag = "Admin"
)]
pub async fn retry_transaction(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let reference = checked_reference(&reference)?;
    let outcome = state.reconciler.retry(reference).await?;
    Ok(outcome_response(outcome))
}

#[utoipa::path(
    get,
    path = "/api/check-balance",
    responses(
        (status = 200, description = "Fulfillment provider wallet balance"),
        (status = 503, description = "Provider unavailable")
    ),
    tag = "Admin"
)]
pub async fn check_balance(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let balance = state.reconciler.provider_balance().await?;

    Ok(Json(json!({
        "status": "success",
        "data": {
            "balance": balance.balance,
            "currency": "GHS",
        },
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FulfillmentReceipt;

    #[test]
    fn test_fulfillment_pending_is_distinct_from_failure() {
        let (status, Json(body)) = outcome_response(ReconcileOutcome::FulfillmentPending {
            reference: "MTN_DATA_1_ab".to_string(),
            code: Some(FailureCode::OutcomeUnknown),
            reason: Some("timed out".to_string()),
        });

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "pending");
        assert_eq!(body["paymentStatus"], "success");
        assert_eq!(body["fulfillmentStatus"], "failed");
        assert_eq!(body["data"]["code"], "OUTCOME_UNKNOWN");
    }

    #[test]
    fn test_fulfilled_response_carries_transaction_id() {
        let (status, Json(body)) = outcome_response(ReconcileOutcome::Fulfilled {
            reference: "MTN_DATA_1_ab".to_string(),
            receipt: FulfillmentReceipt {
                provider_transaction_id: "HUB-1".to_string(),
                raw: json!({"status": true}),
                fulfilled_at: Utc::now(),
            },
        });

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["data"]["transaction_id"], "HUB-1");
    }

    #[test]
    fn test_phase_derived_statuses() {
        assert_eq!(payment_status(Phase::AwaitingPayment), "pending");
        assert_eq!(payment_status(Phase::FulfillmentFailed), "success");
        assert_eq!(fulfillment_status(Phase::PaymentVerified), "not_started");
        assert_eq!(fulfillment_status(Phase::Fulfilling), "processing");
    }

    #[test]
    fn test_reference_format_is_checked() {
        assert!(checked_reference("MTN_DATA_1700000000_ab12").is_ok());
        assert!(checked_reference("x").is_err());
        assert!(checked_reference("../../etc/passwd").is_err());
    }
}
