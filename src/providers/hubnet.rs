//! Data-bundle fulfillment provider adapter.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use super::breaker::{CircuitBreaker, CircuitState};
use super::caller::{ResilientCaller, RetryPolicy};
use super::transport::{HttpTransport, OutboundRequest};
use super::{extract_message, FulfillmentOutcome, ProviderBalance, ProviderError};
use crate::config::Config;
use crate::domain::PurchaseIntent;
use crate::ports::FulfillmentProvider;

pub const BREAKER_NAME: &str = "fulfillment";

/// Upper bound for the advisory balance check made before each submission.
pub const BALANCE_PRECHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct HubnetClient {
    caller: ResilientCaller,
    /// Single attempt, short timeout and no breaker, so a failing balance endpoint
    /// never delays or blocks the submission that follows.
    precheck: ResilientCaller,
    base_url: String,
    api_key: String,
    referrer: String,
    webhook_url: String,
}

impl HubnetClient {
    pub fn new(
        caller: ResilientCaller,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        referrer: impl Into<String>,
        webhook_url: impl Into<String>,
    ) -> Self {
        let precheck = caller.unguarded(RetryPolicy {
            timeout: caller.policy().timeout.min(BALANCE_PRECHECK_TIMEOUT),
            max_retries: 0,
            ..caller.policy().clone()
        });

        Self {
            caller,
            precheck,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            referrer: referrer.into(),
            webhook_url: webhook_url.into(),
        }
    }

    pub fn from_config(config: &Config, transport: Arc<dyn HttpTransport>) -> Self {
        let policy = RetryPolicy {
            timeout: config.fulfillment_timeout,
            max_retries: config.fulfillment_max_retries,
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
            &config.hubnet_base_url,
            &config.hubnet_api_key,
            config.frontend_base_url(),
            config.fulfillment_webhook_url(),
        )
    }

    async fn send(&self, request: OutboundRequest) -> Result<Value, ProviderError> {
        self.send_with(&self.caller, request).await
    }

    async fn send_with(
        &self,
        caller: &ResilientCaller,
        request: OutboundRequest,
    ) -> Result<Value, ProviderError> {
        let request = request.header("token", format!("Bearer {}", self.api_key));
        caller
            .call(request)
            .await
            .map_err(|e| ProviderError::from_call(BREAKER_NAME, e))
    }

    async fn query_balance(&self, caller: &ResilientCaller) -> Result<ProviderBalance, ProviderError> {
        let url = format!("{}/check_balance", self.base_url);
        let response = self.send_with(caller, OutboundRequest::get(url)).await?;

        let balance = parse_balance(&response).ok_or_else(|| {
            ProviderError::MalformedResponse("missing data.wallet_balance".to_string())
        })?;

        Ok(ProviderBalance {
            balance,
            raw: response,
        })
    }

    async fn submit(
        &self,
        reference: &str,
        intent: &PurchaseIntent,
    ) -> Result<FulfillmentOutcome, ProviderError> {
        let url = format!("{}/{}-new-transaction", self.base_url, intent.network);
        let body = json!({
            "phone": intent.target_contact,
            "volume": intent.volume_mb.to_string(),
            "reference": reference,
            "referrer": self.referrer,
            "webhook": self.webhook_url,
        });

        let response = match self.send(OutboundRequest::post(url, body)).await {
            Ok(response) => response,
            Err(ProviderError::ClientRejected { body, message, .. }) => {
                return Ok(classify_failure(&body, message));
            }
            Err(e) => return Err(e),
        };

        if response.get("status").and_then(Value::as_bool) != Some(true) {
            let message = extract_message(&response);
            return Ok(classify_failure(&response, message));
        }

        let provider_transaction_id = match transaction_id(&response) {
            Some(id) => id,
            None => {
                tracing::warn!(
                    reference = %reference,
                    "Fulfillment succeeded without a transaction id, using reference"
                );
                reference.to_string()
            }
        };

        Ok(FulfillmentOutcome::Success {
            provider_transaction_id,
            raw: response,
        })
    }
}

fn transaction_id(response: &Value) -> Option<String> {
    let candidate = response
        .get("transaction_id")
        .or_else(|| response.get("data").and_then(|data| data.get("transaction_id")))?;
    match candidate {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn classify_failure(body: &Value, message: String) -> FulfillmentOutcome {
    let mentions_balance = ["message", "reason", "code"].iter().any(|key| {
        body.get(*key)
            .and_then(Value::as_str)
            .map(|text| text.to_ascii_lowercase().contains("insufficient"))
            .unwrap_or(false)
    });

    if mentions_balance || message.to_ascii_lowercase().contains("insufficient") {
        FulfillmentOutcome::InsufficientUpstreamBalance(message)
    } else {
        FulfillmentOutcome::Rejected(message)
    }
}

fn parse_balance(response: &Value) -> Option<f64> {
    let raw = response
        .get("data")
        .and_then(|data| data.get("wallet_balance"))
        .or_else(|| response.get("wallet_balance"))?;
    match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl FulfillmentProvider for HubnetClient {
    async fn fulfill(
        &self,
        reference: &str,
        intent: &PurchaseIntent,
    ) -> Result<FulfillmentOutcome, ProviderError> {
        let required = intent.amount_minor as f64 / 100.0;
        match self.query_balance(&self.precheck).await {
            Ok(wallet) if wallet.balance < required => {
                tracing::error!(
                    reference = %reference,
                    balance = wallet.balance,
                    required,
                    "Fulfillment wallet balance too low, not submitting"
                );
                return Ok(FulfillmentOutcome::InsufficientUpstreamBalance(format!(
                    "wallet balance {:.2} is below order amount {:.2}",
                    wallet.balance, required
                )));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(reference = %reference, error = %e, "Balance pre-check failed, submitting anyway");
            }
        }

        let outcome = self.submit(reference, intent).await?;
        match &outcome {
            FulfillmentOutcome::Success {
                provider_transaction_id,
                ..
            } => tracing::info!(reference = %reference, provider_transaction_id = %provider_transaction_id, "Bundle fulfilled"),
            FulfillmentOutcome::Rejected(reason) => {
                tracing::warn!(reference = %reference, reason = %reason, "Fulfillment rejected")
            }
            FulfillmentOutcome::InsufficientUpstreamBalance(reason) => {
                tracing::error!(reference = %reference, reason = %reason, "Fulfillment provider out of float")
            }
        }
        Ok(outcome)
    }

    async fn balance(&self) -> Result<ProviderBalance, ProviderError> {
        self.query_balance(&self.caller).await
    }

    fn circuit_state(&self) -> Option<CircuitState> {
        self.caller.breaker().map(CircuitBreaker::state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::transport::{RawResponse, TransportError};
    use crate::providers::ReqwestTransport;
    use mockito::Matcher;
    use reqwest::Method;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn intent() -> PurchaseIntent {
        PurchaseIntent {
            product_code: "mtn-1gb".to_string(),
            network: "mtn".to_string(),
            target_contact: "0551234567".to_string(),
            volume_mb: 1000,
            amount_minor: 550,
            purchaser_email: "a@b.com".to_string(),
        }
    }

    fn client(base_url: &str) -> HubnetClient {
        let policy = RetryPolicy {
            timeout: Duration::from_secs(5),
            max_retries: 0,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
        };
        let caller = ResilientCaller::new(Arc::new(ReqwestTransport::new()), policy, None);
        HubnetClient::new(
            caller,
            base_url,
            "hub_key",
            "http://shop.test",
            "http://relay.test/api/webhooks/fulfillment",
        )
    }

    async fn mock_balance(server: &mut mockito::ServerGuard, body: &str) -> mockito::Mock {
        server
            .mock("GET", "/check_balance")
            .match_header("token", "Bearer hub_key")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await
    }

    #[test]
    fn test_parse_balance_accepts_strings() {
        assert_eq!(parse_balance(&json!({"data": {"wallet_balance": "1,250.50"}})), Some(1250.5));
        assert_eq!(parse_balance(&json!({"data": {"wallet_balance": 12}})), Some(12.0));
        assert_eq!(parse_balance(&json!({"data": {}})), None);
    }

    #[test]
    fn test_failure_classification() {
        let body = json!({"status": false, "reason": "Insufficient balance"});
        assert!(matches!(
            classify_failure(&body, "Insufficient balance".to_string()),
            FulfillmentOutcome::InsufficientUpstreamBalance(_)
        ));

        let body = json!({"status": false, "message": "Invalid recipient"});
        assert_eq!(
            classify_failure(&body, "Invalid recipient".to_string()),
            FulfillmentOutcome::Rejected("Invalid recipient".to_string())
        );
    }

    #[tokio::test]
    async fn test_fulfill_success() {
        let mut server = mockito::Server::new_async().await;
        mock_balance(&mut server, r#"{"status":true,"data":{"wallet_balance":"100.00"}}"#).await;
        let submit = server
            .mock("POST", "/mtn-new-transaction")
            .match_header("token", "Bearer hub_key")
            .match_body(Matcher::PartialJson(json!({
                "phone": "0551234567",
                "volume": "1000",
                "reference": "MTN_DATA_1_abcd",
                "webhook": "http://relay.test/api/webhooks/fulfillment"
            })))
            .with_status(200)
            .with_body(r#"{"status":true,"transaction_id":"HUB-778","message":"queued"}"#)
            .expect(1)
            .create_async()
            .await;

        let outcome = client(&server.url())
            .fulfill("MTN_DATA_1_abcd", &intent())
            .await
            .unwrap();

        submit.assert_async().await;
        match outcome {
            FulfillmentOutcome::Success {
                provider_transaction_id,
                raw,
            } => {
                assert_eq!(provider_transaction_id, "HUB-778");
                assert_eq!(raw["message"], "queued");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_low_balance_skips_submission() {
        let mut server = mockito::Server::new_async().await;
        mock_balance(&mut server, r#"{"status":true,"data":{"wallet_balance":2.5}}"#).await;
        let submit = server
            .mock("POST", "/mtn-new-transaction")
            .expect(0)
            .create_async()
            .await;

        let outcome = client(&server.url())
            .fulfill("MTN_DATA_1_abcd", &intent())
            .await
            .unwrap();

        submit.assert_async().await;
        assert!(matches!(
            outcome,
            FulfillmentOutcome::InsufficientUpstreamBalance(_)
        ));
    }

    #[tokio::test]
    async fn test_balance_failure_does_not_block() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/check_balance")
            .with_status(500)
            .create_async()
            .await;
        server
            .mock("POST", "/mtn-new-transaction")
            .with_status(200)
            .with_body(r#"{"status":true,"transaction_id":"HUB-1"}"#)
            .create_async()
            .await;

        let outcome = client(&server.url())
            .fulfill("MTN_DATA_1_abcd", &intent())
            .await
            .unwrap();

        assert!(matches!(outcome, FulfillmentOutcome::Success { .. }));
    }

    #[tokio::test]
    async fn test_client_error_becomes_rejected_outcome() {
        let mut server = mockito::Server::new_async().await;
        mock_balance(&mut server, r#"{"status":true,"data":{"wallet_balance":"100"}}"#).await;
        server
            .mock("POST", "/mtn-new-transaction")
            .with_status(422)
            .with_body(r#"{"status":false,"message":"Invalid phone number"}"#)
            .create_async()
            .await;

        let outcome = client(&server.url())
            .fulfill("MTN_DATA_1_abcd", &intent())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            FulfillmentOutcome::Rejected("Invalid phone number".to_string())
        );
    }

    #[tokio::test]
    async fn test_in_band_insufficient_balance() {
        let mut server = mockito::Server::new_async().await;
        mock_balance(&mut server, r#"{"status":true,"data":{}}"#).await;
        server
            .mock("POST", "/mtn-new-transaction")
            .with_status(200)
            .with_body(r#"{"status":false,"code":"INSUFFICIENT_BALANCE","message":"Top up your wallet"}"#)
            .create_async()
            .await;

        let outcome = client(&server.url())
            .fulfill("MTN_DATA_1_abcd", &intent())
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            FulfillmentOutcome::InsufficientUpstreamBalance(_)
        ));
    }

    /// Balance endpoint always answers 503, submissions always succeed.
    #[derive(Default)]
    struct BalanceDownTransport {
        balance_calls: AtomicUsize,
        submit_calls: AtomicUsize,
    }

    #[async_trait]
    impl HttpTransport for BalanceDownTransport {
        async fn send(&self, request: &OutboundRequest) -> Result<RawResponse, TransportError> {
            if request.method == Method::GET {
                self.balance_calls.fetch_add(1, Ordering::SeqCst);
                return Ok(RawResponse {
                    status: 503,
                    body: b"maintenance".to_vec(),
                });
            }
            let n = self.submit_calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(RawResponse {
                status: 200,
                body: format!(r#"{{"status":true,"transaction_id":"HUB-{}"}}"#, n).into_bytes(),
            })
        }
    }

    #[tokio::test]
    async fn test_failing_balance_check_never_opens_fulfillment_breaker() {
        let transport = Arc::new(BalanceDownTransport::default());
        let policy = RetryPolicy {
            timeout: Duration::from_secs(5),
            max_retries: 4,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let breaker = CircuitBreaker::new(BREAKER_NAME, 2, Duration::from_secs(60));
        let caller = ResilientCaller::new(transport.clone(), policy, Some(breaker));
        let client = HubnetClient::new(
            caller,
            "http://hubnet.test",
            "hub_key",
            "http://shop.test",
            "http://relay.test/api/webhooks/fulfillment",
        );

        for _ in 0..4 {
            let outcome = client.fulfill("MTN_DATA_1_abcd", &intent()).await.unwrap();
            assert!(matches!(outcome, FulfillmentOutcome::Success { .. }));
        }

        assert_eq!(transport.submit_calls.load(Ordering::SeqCst), 4);
        // One attempt per order, never retried.
        assert_eq!(transport.balance_calls.load(Ordering::SeqCst), 4);
        assert_eq!(client.circuit_state(), Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn test_operator_balance_query_still_retries() {
        let transport = Arc::new(BalanceDownTransport::default());
        let policy = RetryPolicy {
            timeout: Duration::from_secs(5),
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let caller = ResilientCaller::new(transport.clone(), policy, None);
        let client = HubnetClient::new(caller, "http://hubnet.test", "hub_key", "", "");

        assert!(matches!(
            client.balance().await,
            Err(ProviderError::Unavailable { .. })
        ));
        assert_eq!(transport.balance_calls.load(Ordering::SeqCst), 3);
    }
}
