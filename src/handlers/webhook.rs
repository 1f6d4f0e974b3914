use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha512;
use utoipa::ToSchema;

use crate::domain::is_valid_reference;
use crate::error::AppError;
use crate::services::ReconcileError;
use crate::validation::{validate_max_len, validate_required, DELIVERY_STATUS_MAX_LEN};
use crate::AppState;

pub const SIGNATURE_HEADER: &str = "x-paystack-signature";

type HmacSha512 = Hmac<Sha512>;

/// Checks `hex(HMAC-SHA512(secret, body))` in constant time.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha512::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

pub fn sign(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha512::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Deserialize)]
struct GatewayEvent {
    event: String,
    #[serde(default)]
    data: GatewayEventData,
}

#[derive(Debug, Default, Deserialize)]
struct GatewayEventData {
    reference: Option<String>,
}

/// Gateway event notification. The event's own status is never trusted; a
/// `charge.success` only triggers the same verification path the client polls.
#[utoipa::path(
    post,
    path = "/api/webhooks/payment",
    responses(
        (status = 200, description = "Event accepted"),
        (status = 401, description = "Signature missing or invalid")
    ),
    tag = "Webhooks"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing webhook signature".to_string()))?;

    if !verify_signature(&state.config.paystack_secret_key, &body, signature) {
        tracing::warn!("Rejected payment webhook with invalid signature");
        return Err(AppError::Unauthorized("Invalid webhook signature".to_string()));
    }

    let event: GatewayEvent = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("Invalid webhook payload: {}", e)))?;

    let reference = event.data.reference.filter(|r| is_valid_reference(r));
    let Some(reference) = reference.filter(|_| event.event == "charge.success") else {
        tracing::info!(event = %event.event, "Ignoring payment webhook event");
        return Ok(Json(json!({"status": "success", "message": "Event ignored"})));
    };

    tracing::info!(reference = %reference, "Payment webhook received");
    match state.reconciler.verify_and_fulfill(&reference).await {
        Ok(_) => Ok(Json(json!({"status": "success", "message": "Event processed"}))),
        Err(ReconcileError::NotFound(_)) => {
            tracing::warn!(reference = %reference, "Payment webhook for unknown reference");
            Ok(Json(json!({"status": "success", "message": "Unknown reference"})))
        }
        Err(e) => Err(e.into()),
    }
}

/// Delivery report pushed by the fulfillment provider.
#[derive(Debug, Deserialize, ToSchema)]
pub struct DeliveryReport {
    pub reference: String,
    pub status: String,
    pub message: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/webhooks/fulfillment",
    request_body = DeliveryReport,
    responses(
        (status = 200, description = "Report recorded or ignored"),
        (status = 400, description = "Status missing or too long")
    ),
    tag = "Webhooks"
)]
pub async fn fulfillment_webhook(
    State(state): State<AppState>,
    payload: Result<Json<DeliveryReport>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(report) = payload.map_err(|e| AppError::Validation(e.body_text()))?;
    let status = report.status.trim();
    validate_required("status", status)?;
    validate_max_len("status", status, DELIVERY_STATUS_MAX_LEN)?;

    let recorded = state
        .reconciler
        .record_delivery_report(report.reference.trim(), status)
        .await?;

    if !recorded {
        tracing::warn!(reference = %report.reference, "Delivery report for unknown reference");
    } else if let Some(message) = &report.message {
        tracing::debug!(reference = %report.reference, message = %message, "Delivery report message");
    }

    Ok(Json(json!({"status": "success", "recorded": recorded})))
}
