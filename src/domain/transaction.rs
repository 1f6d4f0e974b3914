//! Transaction reconciliation record.
//! Framework-agnostic representation of one purchase attempt, keyed by its reference.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Reconciliation phase of a reference.
///
/// State transitions:
/// ```text
/// Initiated ──► AwaitingPayment ──┬──► PaymentVerified ──► Fulfilling ──┬──► Fulfilled
///                                 │                            ▲        └──► FulfillmentFailed
///                                 └──► PaymentFailed           └─(operator retry)──┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Initiated,
    AwaitingPayment,
    PaymentVerified,
    Fulfilling,
    /// Terminal; the fulfillment response is cached on the record.
    Fulfilled,
    FulfillmentFailed,
    /// Terminal.
    PaymentFailed,
}

impl Phase {
    /// Transitions reachable through the normal verify path.
    pub fn can_transition_to(&self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Initiated, AwaitingPayment)
                | (Initiated, PaymentVerified)
                | (Initiated, PaymentFailed)
                | (AwaitingPayment, PaymentVerified)
                | (AwaitingPayment, PaymentFailed)
                | (PaymentVerified, Fulfilling)
                | (Fulfilling, Fulfilled)
                | (Fulfilling, FulfillmentFailed)
        )
    }

    /// Transitions additionally allowed when an operator explicitly retries a reference.
    pub fn can_operator_transition_to(&self, next: Phase) -> bool {
        use Phase::*;
        self.can_transition_to(next)
            || matches!(
                (self, next),
                (FulfillmentFailed, Fulfilling)
                    | (Fulfilling, Fulfilling)
                    | (PaymentFailed, PaymentVerified)
            )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Fulfilled | Phase::PaymentFailed)
    }

    /// True once the gateway has confirmed the customer's money moved.
    pub fn payment_confirmed(&self) -> bool {
        matches!(
            self,
            Phase::PaymentVerified | Phase::Fulfilling | Phase::Fulfilled | Phase::FulfillmentFailed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Initiated => "INITIATED",
            Phase::AwaitingPayment => "AWAITING_PAYMENT",
            Phase::PaymentVerified => "PAYMENT_VERIFIED",
            Phase::Fulfilling => "FULFILLING",
            Phase::Fulfilled => "FULFILLED",
            Phase::FulfillmentFailed => "FULFILLMENT_FAILED",
            Phase::PaymentFailed => "PAYMENT_FAILED",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why the last attempt on a record failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    GatewayRejected,
    PaymentDeclined,
    AmountMismatch,
    Rejected,
    InsufficientUpstreamBalance,
    ProviderUnavailable,
    CircuitOpen,
    /// The provider may or may not have acted on the request.
    OutcomeUnknown,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::GatewayRejected => "GATEWAY_REJECTED",
            FailureCode::PaymentDeclined => "PAYMENT_DECLINED",
            FailureCode::AmountMismatch => "AMOUNT_MISMATCH",
            FailureCode::Rejected => "REJECTED",
            FailureCode::InsufficientUpstreamBalance => "INSUFFICIENT_UPSTREAM_BALANCE",
            FailureCode::ProviderUnavailable => "PROVIDER_UNAVAILABLE",
            FailureCode::CircuitOpen => "CIRCUIT_OPEN",
            FailureCode::OutcomeUnknown => "OUTCOME_UNKNOWN",
        }
    }
}

/// The original purchase intent, captured at initiation and never modified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PurchaseIntent {
    pub product_code: String,
    pub network: String,
    /// Normalised 10-digit local mobile number.
    pub target_contact: String,
    pub volume_mb: u32,
    /// Amount in minor units (pesewas).
    pub amount_minor: u64,
    pub purchaser_email: String,
}

/// Outcome returned by the fulfillment provider on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct FulfillmentReceipt {
    pub provider_transaction_id: String,
    #[schema(value_type = Object)]
    pub raw: serde_json::Value,
    pub fulfilled_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("illegal phase transition {from} -> {to} for {reference}")]
    Illegal {
        reference: String,
        from: Phase,
        to: Phase,
    },
    #[error("fulfillment response already recorded for {0}")]
    AlreadyFulfilled(String),
}

/// Reconciliation state tracked per reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub reference: String,
    pub phase: Phase,
    pub request_payload: PurchaseIntent,
    pub provider_payment_id: Option<String>,
    pub authorization_url: Option<String>,
    fulfillment_response: Option<FulfillmentReceipt>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub error: Option<String>,
    pub error_code: Option<FailureCode>,
    /// Last delivery report pushed by the fulfillment provider, if any.
    #[serde(default)]
    pub delivery_status: Option<String>,
}

impl TransactionRecord {
    pub fn new(reference: String, request_payload: PurchaseIntent) -> Self {
        let now = Utc::now();
        Self {
            reference,
            phase: Phase::Initiated,
            request_payload,
            provider_payment_id: None,
            authorization_url: None,
            fulfillment_response: None,
            created_at: now,
            updated_at: now,
            last_attempt_at: None,
            attempt_count: 0,
            error: None,
            error_code: None,
            delivery_status: None,
        }
    }

    pub fn fulfillment_response(&self) -> Option<&FulfillmentReceipt> {
        self.fulfillment_response.as_ref()
    }

    /// Moves the record along the normal verify path.
    pub fn transition(&mut self, next: Phase) -> Result<(), TransitionError> {
        if !self.phase.can_transition_to(next) {
            return Err(self.illegal(next));
        }
        self.phase = next;
        Ok(())
    }

    /// Moves the record on behalf of an explicit operator retry.
    pub fn operator_transition(&mut self, next: Phase) -> Result<(), TransitionError> {
        if !self.phase.can_operator_transition_to(next) {
            return Err(self.illegal(next));
        }
        self.phase = next;
        Ok(())
    }

    /// Marks the start of a fulfillment attempt. The caller must already have moved
    /// the record to [`Phase::Fulfilling`].
    pub fn begin_attempt(&mut self) {
        self.attempt_count += 1;
        self.last_attempt_at = Some(Utc::now());
        self.error = None;
        self.error_code = None;
    }

    /// Records the provider's success response and completes the record.
    /// The response can only ever be set once.
    pub fn complete(&mut self, receipt: FulfillmentReceipt) -> Result<(), TransitionError> {
        if self.fulfillment_response.is_some() {
            return Err(TransitionError::AlreadyFulfilled(self.reference.clone()));
        }
        self.transition(Phase::Fulfilled)?;
        self.fulfillment_response = Some(receipt);
        self.error = None;
        self.error_code = None;
        Ok(())
    }

    pub fn record_failure(&mut self, code: FailureCode, message: impl Into<String>) {
        self.error_code = Some(code);
        self.error = Some(message.into());
    }

    fn illegal(&self, to: Phase) -> TransitionError {
        TransitionError::Illegal {
            reference: self.reference.clone(),
            from: self.phase,
            to,
        }
    }
}
