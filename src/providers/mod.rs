pub mod breaker;
pub mod caller;
pub mod hubnet;
pub mod paystack;
pub mod transport;

pub use breaker::{CircuitBreaker, CircuitState};
pub use caller::{CallError, ResilientCaller, RetryPolicy};
pub use hubnet::HubnetClient;
pub use paystack::PaystackClient;
pub use transport::{HttpTransport, OutboundRequest, RawResponse, ReqwestTransport};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::domain::FailureCode;

/// Failure at the adapter boundary. Raw transport errors are folded into these
/// variants before they reach the reconciler.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("provider rejected the request (HTTP {status}): {message}")]
    ClientRejected {
        status: u16,
        message: String,
        body: Value,
    },
    #[error("provider unavailable after {attempts} attempt(s): {reason}")]
    Unavailable {
        attempts: u32,
        reason: String,
        timed_out: bool,
    },
    #[error("circuit breaker open for {0}")]
    CircuitOpen(String),
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
}

impl ProviderError {
    /// True when the provider may have acted on the request without us seeing the result.
    pub fn is_ambiguous(&self) -> bool {
        matches!(
            self,
            ProviderError::Unavailable { .. } | ProviderError::MalformedResponse(_)
        )
    }

    pub fn failure_code(&self) -> FailureCode {
        match self {
            ProviderError::ClientRejected { .. } => FailureCode::Rejected,
            ProviderError::CircuitOpen(_) => FailureCode::CircuitOpen,
            ProviderError::Unavailable { .. } | ProviderError::MalformedResponse(_) => {
                FailureCode::OutcomeUnknown
            }
        }
    }

    pub(crate) fn from_call(provider: &str, err: CallError) -> Self {
        match err {
            CallError::ClientRejected { status, body } => ProviderError::ClientRejected {
                status,
                message: extract_message(&body),
                body,
            },
            CallError::CircuitOpen => ProviderError::CircuitOpen(provider.to_string()),
            CallError::MalformedResponse { status, detail } => {
                ProviderError::MalformedResponse(format!("HTTP {}: {}", status, detail))
            }
            CallError::ProviderUnavailable { attempts, last } => ProviderError::Unavailable {
                attempts,
                timed_out: last.timed_out(),
                reason: last.to_string(),
            },
            other => ProviderError::Unavailable {
                attempts: 1,
                timed_out: other.timed_out(),
                reason: other.to_string(),
            },
        }
    }
}

/// Human-readable message from a provider error payload.
pub(crate) fn extract_message(body: &Value) -> String {
    ["message", "reason", "error"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_str))
        .map(str::to_string)
        .or_else(|| body.as_str().map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Success,
    Pending,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentInit {
    pub authorization_url: String,
    pub access_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentVerification {
    pub status: PaymentStatus,
    /// Amount actually paid, in minor units.
    pub amount_minor: Option<u64>,
    pub provider_payment_id: Option<String>,
    pub metadata: Value,
    /// Raw gateway status string, e.g. `abandoned`.
    pub gateway_response: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FulfillmentOutcome {
    Success {
        provider_transaction_id: String,
        raw: Value,
    },
    Rejected(String),
    InsufficientUpstreamBalance(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderBalance {
    /// Wallet balance in major units (GHS).
    pub balance: f64,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub raw: Value,
}
