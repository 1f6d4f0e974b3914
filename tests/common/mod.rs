#![allow(dead_code)]

use async_trait::async_trait;
use bundle_relay::config::Config;
use bundle_relay::domain::PurchaseIntent;
use bundle_relay::ports::{FulfillmentProvider, PaymentGateway};
use bundle_relay::providers::{
    FulfillmentOutcome, PaymentInit, PaymentStatus, PaymentVerification, ProviderBalance,
    ProviderError,
};
use bundle_relay::services::Reconciler;
use bundle_relay::store::TransactionStore;
use bundle_relay::{create_app, AppState};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn intent() -> PurchaseIntent {
    PurchaseIntent {
        product_code: "mtn-1gb".to_string(),
        network: "mtn".to_string(),
        target_contact: "0551234567".to_string(),
        volume_mb: 1000,
        amount_minor: 550,
        purchaser_email: "a@b.com".to_string(),
    }
}

/// Payment gateway whose verification answer can be changed between calls.
pub struct StubGateway {
    status: Mutex<PaymentStatus>,
    amount_paid: Mutex<Option<u64>>,
    unavailable: AtomicBool,
    pub init_calls: AtomicUsize,
    pub verify_calls: AtomicUsize,
}

impl StubGateway {
    pub fn new(status: PaymentStatus) -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(status),
            amount_paid: Mutex::new(None),
            unavailable: AtomicBool::new(false),
            init_calls: AtomicUsize::new(0),
            verify_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_status(&self, status: PaymentStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn set_amount_paid(&self, amount: Option<u64>) {
        *self.amount_paid.lock().unwrap() = amount;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for StubGateway {
    async fn initialize(
        &self,
        reference: &str,
        _intent: &PurchaseIntent,
    ) -> Result<PaymentInit, ProviderError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        Ok(PaymentInit {
            authorization_url: format!("https://checkout.test/{}", reference),
            access_code: Some("access".to_string()),
        })
    }

    async fn verify(&self, _reference: &str) -> Result<PaymentVerification, ProviderError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable {
                attempts: 4,
                reason: "connection refused".to_string(),
                timed_out: false,
            });
        }

        let status = *self.status.lock().unwrap();
        let gateway_response = match status {
            PaymentStatus::Success => "success",
            PaymentStatus::Pending => "ongoing",
            PaymentStatus::Failed => "failed",
        };
        Ok(PaymentVerification {
            status,
            amount_minor: *self.amount_paid.lock().unwrap(),
            provider_payment_id: Some("PSK-4099".to_string()),
            metadata: json!({"phone": "0551234567", "network": "mtn"}),
            gateway_response: gateway_response.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub enum FulfillMode {
    Succeed,
    Reject(String),
    Insufficient,
    TimeOut,
}

/// Fulfillment provider that counts calls and can be told how to answer.
pub struct StubFulfillment {
    mode: Mutex<FulfillMode>,
    delay: Duration,
    pub calls: AtomicUsize,
    pub balance: Mutex<f64>,
}

impl StubFulfillment {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(FulfillMode::Succeed),
            delay,
            calls: AtomicUsize::new(0),
            balance: Mutex::new(250.0),
        })
    }

    pub fn set_mode(&self, mode: FulfillMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FulfillmentProvider for StubFulfillment {
    async fn fulfill(
        &self,
        reference: &str,
        _intent: &PurchaseIntent,
    ) -> Result<FulfillmentOutcome, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let mode = self.mode.lock().unwrap().clone();
        match mode {
            FulfillMode::Succeed => Ok(FulfillmentOutcome::Success {
                provider_transaction_id: format!("HUB-{}", call),
                raw: json!({"status": true, "reference": reference, "transaction_id": format!("HUB-{}", call)}),
            }),
            FulfillMode::Reject(reason) => Ok(FulfillmentOutcome::Rejected(reason)),
            FulfillMode::Insufficient => Ok(FulfillmentOutcome::InsufficientUpstreamBalance(
                "Insufficient wallet balance".to_string(),
            )),
            FulfillMode::TimeOut => Err(ProviderError::Unavailable {
                attempts: 3,
                reason: "request timed out after 45s".to_string(),
                timed_out: true,
            }),
        }
    }

    async fn balance(&self) -> Result<ProviderBalance, ProviderError> {
        Ok(ProviderBalance {
            balance: *self.balance.lock().unwrap(),
            raw: Value::Null,
        })
    }
}

pub fn reconciler(
    store: TransactionStore,
    gateway: &Arc<StubGateway>,
    fulfillment: &Arc<StubFulfillment>,
) -> Reconciler {
    Reconciler::new(store, gateway.clone(), fulfillment.clone())
}

pub fn test_config() -> Config {
    let mut config = Config::with_credentials("sk_test_secret", "hub_key");
    config.public_base_url = "http://relay.test".to_string();
    config.frontend_origin = Some("http://shop.test".to_string());
    config
}

pub struct TestApp {
    pub base_url: String,
    pub gateway: Arc<StubGateway>,
    pub fulfillment: Arc<StubFulfillment>,
    pub store: TransactionStore,
    pub client: reqwest::Client,
}

pub async fn spawn_app(config: Config) -> TestApp {
    let gateway = StubGateway::new(PaymentStatus::Pending);
    let fulfillment = StubFulfillment::new();
    let store = TransactionStore::in_memory();
    let reconciler = reconciler(store.clone(), &gateway, &fulfillment);
    let app = create_app(AppState::new(reconciler, Arc::new(config)));

    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], 0));
    let server = axum::Server::bind(&addr).serve(app.into_make_service());
    let actual_addr = server.local_addr();

    tokio::spawn(async move {
        server.await.unwrap();
    });

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();

    TestApp {
        base_url: format!("http://{}", actual_addr),
        gateway,
        fulfillment,
        store,
        client,
    }
}
