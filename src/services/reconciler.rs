//! Reconciliation core.
//!
//! Every entry point that can lead to a fulfillment call funnels through the same
//! sequence: cached-result check, per-reference lock, re-read, gateway verification,
//! fulfillment. The fulfillment response is written at most once per reference and
//! replayed from the store afterwards.

use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;

use super::locks::ReferenceLocks;
use crate::domain::{
    generate_reference, FailureCode, FulfillmentReceipt, Phase, PurchaseIntent,
    TransactionRecord, TransitionError,
};
use crate::ports::{FulfillmentProvider, PaymentGateway};
use crate::providers::{
    CircuitState, FulfillmentOutcome, PaymentStatus, ProviderBalance, ProviderError,
};
use crate::store::{StoreError, TransactionStore};

const REFERENCE_ATTEMPTS: usize = 5;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("transaction {0} not found")]
    NotFound(String),
    #[error("payment gateway error: {0}")]
    Gateway(ProviderError),
    #[error("fulfillment provider error: {0}")]
    Fulfillment(ProviderError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("reconciliation task failed: {0}")]
    Task(String),
    #[error("could not allocate a unique transaction reference")]
    ReferenceExhausted,
}

/// Result of `verify_and_fulfill` or `retry`.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// Fulfillment succeeded, now or earlier. Replays are indistinguishable from the first.
    Fulfilled {
        reference: String,
        receipt: FulfillmentReceipt,
    },
    /// The gateway has not settled the payment yet.
    Pending {
        reference: String,
        gateway_status: String,
    },
    PaymentFailed {
        reference: String,
        code: FailureCode,
        reason: String,
    },
    /// The customer has paid but the bundle has not been delivered.
    FulfillmentPending {
        reference: String,
        code: Option<FailureCode>,
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitiatedPayment {
    pub reference: String,
    pub authorization_url: String,
}

enum PaymentCheck {
    Confirmed,
    Pending(String),
    Failed(FailureCode, String),
}

#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

struct InFlightGuard(Arc<InFlight>);

impl InFlightGuard {
    fn enter(tracker: &Arc<InFlight>) -> Self {
        tracker.count.fetch_add(1, Ordering::SeqCst);
        Self(tracker.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

#[derive(Clone)]
pub struct Reconciler {
    store: TransactionStore,
    gateway: Arc<dyn PaymentGateway>,
    fulfillment: Arc<dyn FulfillmentProvider>,
    locks: ReferenceLocks,
    in_flight: Arc<InFlight>,
}

impl Reconciler {
    pub fn new(
        store: TransactionStore,
        gateway: Arc<dyn PaymentGateway>,
        fulfillment: Arc<dyn FulfillmentProvider>,
    ) -> Self {
        Self {
            store,
            gateway,
            fulfillment,
            locks: ReferenceLocks::new(),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn store(&self) -> &TransactionStore {
        &self.store
    }

    pub fn gateway_circuit(&self) -> Option<CircuitState> {
        self.gateway.circuit_state()
    }

    pub fn fulfillment_circuit(&self) -> Option<CircuitState> {
        self.fulfillment.circuit_state()
    }

    /// Creates the record, then opens a hosted checkout for it.
    pub async fn initiate(
        &self,
        intent: PurchaseIntent,
        prefix: &str,
    ) -> Result<InitiatedPayment, ReconcileError> {
        let mut record = self.create_record(intent, prefix).await?;
        let reference = record.reference.clone();

        match self
            .gateway
            .initialize(&reference, &record.request_payload)
            .await
        {
            Ok(init) => {
                record.transition(Phase::AwaitingPayment)?;
                record.authorization_url = Some(init.authorization_url.clone());
                self.store.put(record).await;

                tracing::info!(reference = %reference, "Payment initiated");
                Ok(InitiatedPayment {
                    reference,
                    authorization_url: init.authorization_url,
                })
            }
            Err(e) => {
                tracing::error!(reference = %reference, error = %e, "Payment initialization failed");
                record.record_failure(FailureCode::GatewayRejected, e.to_string());
                self.store.put(record).await;
                Err(ReconcileError::Gateway(e))
            }
        }
    }

    async fn create_record(
        &self,
        intent: PurchaseIntent,
        prefix: &str,
    ) -> Result<TransactionRecord, ReconcileError> {
        for _ in 0..REFERENCE_ATTEMPTS {
            let record = TransactionRecord::new(generate_reference(prefix), intent.clone());
            if self.store.create(record.clone()).await {
                return Ok(record);
            }
            tracing::warn!(reference = %record.reference, "Reference collision, regenerating");
        }
        Err(ReconcileError::ReferenceExhausted)
    }

    /// Verifies payment and fulfills the order at most once.
    ///
    /// Runs on its own task so that a caller giving up on the HTTP response does not
    /// cancel a fulfillment call that is already on the wire.
    pub async fn verify_and_fulfill(
        &self,
        reference: &str,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let this = self.clone();
        let reference = reference.to_string();
        let guard = InFlightGuard::enter(&self.in_flight);

        tokio::spawn(async move {
            let _guard = guard;
            this.run_verify_and_fulfill(&reference).await
        })
        .await
        .map_err(|e| ReconcileError::Task(e.to_string()))?
    }

    async fn run_verify_and_fulfill(
        &self,
        reference: &str,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let snapshot = self.load(reference).await?;
        if snapshot.phase == Phase::Fulfilled {
            return Ok(replay(&snapshot));
        }

        let _lock = self.locks.acquire(reference).await;
        let mut record = self.load(reference).await?;

        match record.phase {
            Phase::Fulfilled => return Ok(replay(&record)),
            Phase::PaymentFailed => return Ok(payment_failed(&record)),
            Phase::Fulfilling | Phase::FulfillmentFailed => {
                return Ok(fulfillment_pending(&record));
            }
            Phase::PaymentVerified => {}
            Phase::Initiated | Phase::AwaitingPayment => {
                match self.confirm_payment(&mut record, false).await? {
                    PaymentCheck::Confirmed => {}
                    PaymentCheck::Pending(gateway_status) => {
                        return Ok(ReconcileOutcome::Pending {
                            reference: reference.to_string(),
                            gateway_status,
                        });
                    }
                    PaymentCheck::Failed(code, reason) => {
                        return Ok(ReconcileOutcome::PaymentFailed {
                            reference: reference.to_string(),
                            code,
                            reason,
                        });
                    }
                }
            }
        }

        self.fulfill_locked(record, false).await
    }

    /// Operator re-attempt. Re-verifies the payment and fulfills again unless the
    /// reference is already fulfilled, in which case the cached result is returned.
    pub async fn retry(&self, reference: &str) -> Result<ReconcileOutcome, ReconcileError> {
        let this = self.clone();
        let reference = reference.to_string();
        let guard = InFlightGuard::enter(&self.in_flight);

        tokio::spawn(async move {
            let _guard = guard;
            this.run_retry(&reference).await
        })
        .await
        .map_err(|e| ReconcileError::Task(e.to_string()))?
    }

    async fn run_retry(&self, reference: &str) -> Result<ReconcileOutcome, ReconcileError> {
        let _lock = self.locks.acquire(reference).await;
        let mut record = self.load(reference).await?;

        if record.phase == Phase::Fulfilled {
            tracing::info!(reference = %reference, "Retry requested for fulfilled reference, replaying");
            return Ok(replay(&record));
        }

        tracing::info!(reference = %reference, phase = %record.phase, "Operator retry");

        match self.confirm_payment(&mut record, true).await? {
            PaymentCheck::Confirmed => self.fulfill_locked(record, true).await,
            PaymentCheck::Pending(gateway_status) => Ok(ReconcileOutcome::Pending {
                reference: reference.to_string(),
                gateway_status,
            }),
            PaymentCheck::Failed(code, reason) => Ok(ReconcileOutcome::PaymentFailed {
                reference: reference.to_string(),
                code,
                reason,
            }),
        }
    }

    /// Current record. Re-verifies with the gateway while payment is unconfirmed and
    /// nobody else holds the reference. Never fulfills.
    pub async fn transaction_status(
        &self,
        reference: &str,
    ) -> Result<TransactionRecord, ReconcileError> {
        let record = self.load(reference).await?;
        if !awaiting_payment(&record) {
            return Ok(record);
        }

        let Some(_lock) = self.locks.try_acquire(reference).await else {
            return Ok(record);
        };

        let mut record = self.load(reference).await?;
        if awaiting_payment(&record) {
            match self.confirm_payment(&mut record, false).await {
                Ok(_) => {}
                Err(ReconcileError::Gateway(e)) => {
                    tracing::warn!(reference = %reference, error = %e, "Status re-verification failed");
                }
                Err(e) => return Err(e),
            }
        }

        self.load(reference).await
    }

    /// Stores a delivery report pushed by the fulfillment provider. Returns `false`
    /// for unknown references.
    pub async fn record_delivery_report(
        &self,
        reference: &str,
        status: &str,
    ) -> Result<bool, ReconcileError> {
        if !self.store.has(reference).await {
            return Ok(false);
        }

        let _lock = self.locks.acquire(reference).await;
        let Some(mut record) = self.store.get(reference).await else {
            return Ok(false);
        };

        tracing::info!(
            reference = %reference,
            phase = %record.phase,
            delivery_status = %status,
            "Delivery report received"
        );
        record.delivery_status = Some(status.to_string());
        self.store.put(record).await;
        Ok(true)
    }

    pub async fn provider_balance(&self) -> Result<ProviderBalance, ReconcileError> {
        self.fulfillment
            .balance()
            .await
            .map_err(ReconcileError::Fulfillment)
    }

    /// Waits until in-flight reconciliations finish, up to `timeout`. Returns `false`
    /// if some were still running.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let idle = self.in_flight.idle.notified();
            let running = self.in_flight.count.load(Ordering::SeqCst);
            if running == 0 {
                return true;
            }
            tracing::info!(running, "Waiting for in-flight reconciliations");
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                return self.in_flight.count.load(Ordering::SeqCst) == 0;
            }
        }
    }

    async fn load(&self, reference: &str) -> Result<TransactionRecord, ReconcileError> {
        self.store
            .get(reference)
            .await
            .ok_or_else(|| ReconcileError::NotFound(reference.to_string()))
    }

    /// Asks the gateway about the payment and moves the record accordingly.
    /// `operator` allows reviving a `PAYMENT_FAILED` record the gateway now reports paid.
    async fn confirm_payment(
        &self,
        record: &mut TransactionRecord,
        operator: bool,
    ) -> Result<PaymentCheck, ReconcileError> {
        let reference = record.reference.clone();
        let verification = self
            .gateway
            .verify(&reference)
            .await
            .map_err(ReconcileError::Gateway)?;

        if let Some(id) = verification.provider_payment_id.clone() {
            record.provider_payment_id = Some(id);
        }

        match verification.status {
            PaymentStatus::Pending => {
                tracing::debug!(reference = %reference, gateway_status = %verification.gateway_response, "Payment pending");
                Ok(PaymentCheck::Pending(verification.gateway_response))
            }
            PaymentStatus::Failed => {
                let reason = format!("payment {}", verification.gateway_response);
                if awaiting_payment(record) {
                    record.transition(Phase::PaymentFailed)?;
                    record.record_failure(FailureCode::PaymentDeclined, reason.clone());
                    self.store.put(record.clone()).await;
                    tracing::info!(reference = %reference, reason = %reason, "Payment failed");
                } else {
                    tracing::warn!(reference = %reference, phase = %record.phase, reason = %reason, "Gateway no longer reports payment as successful");
                }
                Ok(PaymentCheck::Failed(FailureCode::PaymentDeclined, reason))
            }
            PaymentStatus::Success if record.phase.payment_confirmed() => Ok(PaymentCheck::Confirmed),
            PaymentStatus::Success => {
                let expected = record.request_payload.amount_minor;
                if let Some(paid) = verification.amount_minor.filter(|paid| *paid < expected) {
                    let reason = format!("paid {} but order requires {}", paid, expected);
                    tracing::error!(reference = %reference, paid, expected, "Payment amount mismatch");
                    if awaiting_payment(record) {
                        record.transition(Phase::PaymentFailed)?;
                    }
                    record.record_failure(FailureCode::AmountMismatch, reason.clone());
                    self.store.put(record.clone()).await;
                    return Ok(PaymentCheck::Failed(FailureCode::AmountMismatch, reason));
                }

                warn_on_metadata_mismatch(record, &verification.metadata);

                if operator {
                    record.operator_transition(Phase::PaymentVerified)?;
                } else {
                    record.transition(Phase::PaymentVerified)?;
                }
                record.error = None;
                record.error_code = None;
                self.store.put(record.clone()).await;

                tracing::info!(reference = %reference, "Payment verified");
                Ok(PaymentCheck::Confirmed)
            }
        }
    }

    /// Issues the fulfillment call. Caller must hold the reference lock and the
    /// payment must be confirmed.
    async fn fulfill_locked(
        &self,
        mut record: TransactionRecord,
        operator: bool,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let reference = record.reference.clone();

        if operator {
            record.operator_transition(Phase::Fulfilling)?;
        } else {
            record.transition(Phase::Fulfilling)?;
        }
        record.begin_attempt();
        // The intent to fulfill must be on disk before the side effect happens.
        self.store.put_durable(record.clone()).await?;

        tracing::info!(reference = %reference, attempt = record.attempt_count, "Submitting fulfillment");

        let intent = record.request_payload.clone();
        let (code, reason) = match self.fulfillment.fulfill(&reference, &intent).await {
            Ok(FulfillmentOutcome::Success {
                provider_transaction_id,
                raw,
            }) => {
                let receipt = FulfillmentReceipt {
                    provider_transaction_id,
                    raw,
                    fulfilled_at: Utc::now(),
                };
                record.complete(receipt.clone())?;
                if let Err(e) = self.store.put_durable(record).await {
                    tracing::error!(reference = %reference, error = %e, "Fulfilled record not flushed yet, flusher will retry");
                }
                return Ok(ReconcileOutcome::Fulfilled { reference, receipt });
            }
            Ok(FulfillmentOutcome::Rejected(reason)) => (FailureCode::Rejected, reason),
            Ok(FulfillmentOutcome::InsufficientUpstreamBalance(reason)) => {
                (FailureCode::InsufficientUpstreamBalance, reason)
            }
            Err(e) => {
                if e.is_ambiguous() {
                    tracing::error!(reference = %reference, error = %e, "Fulfillment outcome unknown, operator must reconcile");
                }
                (e.failure_code(), e.to_string())
            }
        };

        record.transition(Phase::FulfillmentFailed)?;
        record.record_failure(code, reason.clone());
        if let Err(e) = self.store.put_durable(record).await {
            tracing::error!(reference = %reference, error = %e, "Failed record not flushed yet, flusher will retry");
        }

        tracing::warn!(reference = %reference, code = code.as_str(), reason = %reason, "Fulfillment failed after payment");
        Ok(ReconcileOutcome::FulfillmentPending {
            reference,
            code: Some(code),
            reason: Some(reason),
        })
    }
}

fn awaiting_payment(record: &TransactionRecord) -> bool {
    matches!(record.phase, Phase::Initiated | Phase::AwaitingPayment)
}

fn replay(record: &TransactionRecord) -> ReconcileOutcome {
    match record.fulfillment_response() {
        Some(receipt) => {
            tracing::debug!(reference = %record.reference, "Replaying cached fulfillment");
            ReconcileOutcome::Fulfilled {
                reference: record.reference.clone(),
                receipt: receipt.clone(),
            }
        }
        // Unreachable through `complete`, which sets both together.
        None => fulfillment_pending(record),
    }
}

fn payment_failed(record: &TransactionRecord) -> ReconcileOutcome {
    ReconcileOutcome::PaymentFailed {
        reference: record.reference.clone(),
        code: record.error_code.unwrap_or(FailureCode::PaymentDeclined),
        reason: record
            .error
            .clone()
            .unwrap_or_else(|| "payment failed".to_string()),
    }
}

fn fulfillment_pending(record: &TransactionRecord) -> ReconcileOutcome {
    ReconcileOutcome::FulfillmentPending {
        reference: record.reference.clone(),
        code: record.error_code,
        reason: record.error.clone(),
    }
}

fn warn_on_metadata_mismatch(record: &TransactionRecord, metadata: &serde_json::Value) {
    let intent = &record.request_payload;
    let phone = metadata.get("phone").and_then(|v| v.as_str());
    let network = metadata.get("network").and_then(|v| v.as_str());

    if phone.map_or(false, |p| p != intent.target_contact)
        || network.map_or(false, |n| !n.eq_ignore_ascii_case(&intent.network))
    {
        tracing::warn!(
            reference = %record.reference,
            gateway_phone = ?phone,
            gateway_network = ?network,
            "Gateway metadata differs from stored order, fulfilling the stored order"
        );
    }
}
