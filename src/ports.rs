//! Seams between the reconciler and the outside world.

use async_trait::async_trait;

use crate::domain::PurchaseIntent;
use crate::providers::{
    CircuitState, FulfillmentOutcome, PaymentInit, PaymentVerification, ProviderBalance,
    ProviderError,
};

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Opens a hosted checkout for `reference`.
    async fn initialize(
        &self,
        reference: &str,
        intent: &PurchaseIntent,
    ) -> Result<PaymentInit, ProviderError>;

    /// Asks the gateway what happened to the payment. Safe to repeat.
    async fn verify(&self, reference: &str) -> Result<PaymentVerification, ProviderError>;

    fn circuit_state(&self) -> Option<CircuitState> {
        None
    }
}

#[async_trait]
pub trait FulfillmentProvider: Send + Sync {
    /// Submits the order. Not idempotent on the wire; callers must hold the
    /// reference lock.
    async fn fulfill(
        &self,
        reference: &str,
        intent: &PurchaseIntent,
    ) -> Result<FulfillmentOutcome, ProviderError>;

    async fn balance(&self) -> Result<ProviderBalance, ProviderError>;

    fn circuit_state(&self) -> Option<CircuitState> {
        None
    }
}
