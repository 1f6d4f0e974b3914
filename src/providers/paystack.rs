//! Hosted-checkout payment gateway adapter.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use super::breaker::{CircuitBreaker, CircuitState};
use super::caller::{ResilientCaller, RetryPolicy};
use super::transport::{HttpTransport, OutboundRequest};
use super::{extract_message, PaymentInit, PaymentStatus, PaymentVerification, ProviderError};
use crate::config::Config;
use crate::domain::PurchaseIntent;
use crate::ports::PaymentGateway;

pub const BREAKER_NAME: &str = "payment_gateway";
const CURRENCY: &str = "GHS";

#[derive(Clone)]
pub struct PaystackClient {
    caller: ResilientCaller,
    base_url: String,
    secret_key: String,
    callback_url: String,
}

impl PaystackClient {
    pub fn new(
        caller: ResilientCaller,
        base_url: impl Into<String>,
        secret_key: impl Into<String>,
        callback_url: impl Into<String>,
    ) -> Self {
        Self {
            caller,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
            callback_url: callback_url.into(),
        }
    }

    pub fn from_config(config: &Config, transport: Arc<dyn HttpTransport>) -> Self {
        let policy = RetryPolicy {
            timeout: config.payment_timeout,
            max_retries: config.payment_max_retries,
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
        };
        let breaker = CircuitBreaker::new(
            BREAKER_NAME,
            config.breaker_failure_threshold,
            config.breaker_reset,
        );
        let caller = ResilientCaller::new(transport, policy, Some(breaker));

        Self::new(
            caller,
            &config.paystack_base_url,
            &config.paystack_secret_key,
            config.payment_callback_url(),
        )
    }

    async fn send(&self, request: OutboundRequest) -> Result<Value, ProviderError> {
        let request = request.header("Authorization", format!("Bearer {}", self.secret_key));
        let body = self
            .caller
            .call(request)
            .await
            .map_err(|e| ProviderError::from_call(BREAKER_NAME, e))?;

        // The gateway reports logical failures in-band with `status: false`.
        if body.get("status").and_then(Value::as_bool) == Some(false) {
            return Err(ProviderError::ClientRejected {
                status: 200,
                message: extract_message(&body),
                body,
            });
        }
        Ok(body)
    }
}

/// Maps the gateway's transaction status onto the three outcomes the reconciler acts on.
fn classify_status(status: &str) -> PaymentStatus {
    match status.to_ascii_lowercase().as_str() {
        "success" => PaymentStatus::Success,
        "failed" | "reversed" | "cancelled" => PaymentStatus::Failed,
        _ => PaymentStatus::Pending,
    }
}

/// Metadata may come back as an object or as a JSON-encoded string.
fn normalize_metadata(metadata: Option<&Value>) -> Value {
    match metadata {
        Some(Value::String(raw)) => serde_json::from_str(raw).unwrap_or(Value::Null),
        Some(value) => value.clone(),
        None => Value::Null,
    }
}

fn id_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl PaymentGateway for PaystackClient {
    async fn initialize(
        &self,
        reference: &str,
        intent: &PurchaseIntent,
    ) -> Result<PaymentInit, ProviderError> {
        let body = json!({
            "amount": intent.amount_minor,
            "email": intent.purchaser_email,
            "currency": CURRENCY,
            "reference": reference,
            "callback_url": self.callback_url,
            "metadata": {
                "network": intent.network,
                "phone": intent.target_contact,
                "volume": intent.volume_mb.to_string(),
                "product_code": intent.product_code,
            },
        });

        let url = format!("{}/transaction/initialize", self.base_url);
        let response = self.send(OutboundRequest::post(url, body)).await?;

        let data = &response["data"];
        let authorization_url = data["authorization_url"]
            .as_str()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                ProviderError::MalformedResponse("missing data.authorization_url".to_string())
            })?;

        tracing::info!(reference = %reference, "Payment initialized");

        Ok(PaymentInit {
            authorization_url: authorization_url.to_string(),
            access_code: data["access_code"].as_str().map(str::to_string),
        })
    }

    async fn verify(&self, reference: &str) -> Result<PaymentVerification, ProviderError> {
        let url = format!("{}/transaction/verify/{}", self.base_url, reference);
        let response = self.send(OutboundRequest::get(url)).await?;

        let data = &response["data"];
        let gateway_status = data["status"].as_str().ok_or_else(|| {
            ProviderError::MalformedResponse("missing data.status".to_string())
        })?;
        let status = classify_status(gateway_status);

        tracing::debug!(reference = %reference, gateway_status, ?status, "Payment verified");

        Ok(PaymentVerification {
            status,
            amount_minor: data["amount"].as_u64(),
            provider_payment_id: id_to_string(&data["id"]),
            metadata: normalize_metadata(data.get("metadata")),
            gateway_response: gateway_status.to_string(),
        })
    }

    fn circuit_state(&self) -> Option<CircuitState> {
        self.caller.breaker().map(CircuitBreaker::state)
    }
}
