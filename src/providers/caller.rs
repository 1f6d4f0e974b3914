//! Resilient remote caller: per-attempt timeout, exponential backoff with jitter,
//! and optional circuit breaking around any outbound JSON call.

use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout};

use super::breaker::CircuitBreaker;
use super::transport::{HttpTransport, OutboundRequest, RawResponse};

#[derive(Error, Debug)]
pub enum CallError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("upstream returned HTTP {status}")]
    Upstream { status: u16, body: String },
    #[error("request rejected with HTTP {status}: {body}")]
    ClientRejected { status: u16, body: Value },
    #[error("circuit breaker open")]
    CircuitOpen,
    #[error("malformed response (HTTP {status}): {detail}")]
    MalformedResponse { status: u16, detail: String },
    #[error("provider unavailable after {attempts} attempt(s): {last}")]
    ProviderUnavailable { attempts: u32, last: Box<CallError> },
}

impl CallError {
    /// Worth another attempt: timeouts, network failures, 5xx and 429.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CallError::Timeout(_) | CallError::Network(_) | CallError::Upstream { .. }
        )
    }

    /// Counts as an upstream health failure for the circuit breaker.
    pub fn trips_breaker(&self) -> bool {
        self.is_transient() || matches!(self, CallError::MalformedResponse { .. })
    }

    /// True if the last attempt ended without a response, so the upstream may have
    /// acted on the request.
    pub fn timed_out(&self) -> bool {
        match self {
            CallError::Timeout(_) => true,
            CallError::ProviderUnavailable { last, .. } => last.timed_out(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Applied to each attempt separately.
    pub timeout: Duration,
    /// Retries after the first attempt; `3` means at most four attempts.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// `base * 2^(attempt-1) * U(0.9, 1.1)`, capped at `max_delay`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let raw = self.base_delay.as_secs_f64() * f64::from(1u32 << exponent);
        let jitter = rand::thread_rng().gen_range(0.9..=1.1);
        let delay = Duration::from_secs_f64(raw * jitter);
        delay.min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

#[derive(Clone)]
pub struct ResilientCaller {
    transport: Arc<dyn HttpTransport>,
    policy: RetryPolicy,
    breaker: Option<CircuitBreaker>,
}

impl ResilientCaller {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        policy: RetryPolicy,
        breaker: Option<CircuitBreaker>,
    ) -> Self {
        Self {
            transport,
            policy,
            breaker,
        }
    }

    /// A caller on the same transport with its own policy and no circuit breaker.
    pub fn unguarded(&self, policy: RetryPolicy) -> Self {
        Self {
            transport: self.transport.clone(),
            policy,
            breaker: None,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    /// Sends `request`, retrying transient failures, and returns the parsed JSON body.
    ///
    /// Exhausted retries surface as [`CallError::ProviderUnavailable`]; client errors,
    /// malformed 2xx bodies and an open circuit fail immediately.
    pub async fn call(&self, request: OutboundRequest) -> Result<Value, CallError> {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let result = match &self.breaker {
                Some(breaker) => breaker.guard(self.attempt(&request)).await,
                None => self.attempt(&request).await,
            };

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(url = %request.url, attempt, "Upstream call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt <= self.policy.max_retries => {
                    let delay = self.policy.backoff_delay(attempt);
                    tracing::warn!(
                        url = %request.url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Upstream call failed, retrying"
                    );
                    sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    tracing::error!(url = %request.url, attempts = attempt, error = %e, "Upstream call exhausted retries");
                    return Err(CallError::ProviderUnavailable {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    tracing::warn!(url = %request.url, attempt, error = %e, "Upstream call failed without retry");
                    return Err(e);
                }
            }
        }
    }

    async fn attempt(&self, request: &OutboundRequest) -> Result<Value, CallError> {
        let response = match timeout(self.policy.timeout, self.transport.send(request)).await {
            Err(_) => return Err(CallError::Timeout(self.policy.timeout)),
            Ok(Err(e)) => return Err(CallError::Network(e.to_string())),
            Ok(Ok(response)) => response,
        };

        classify(response)
    }
}

fn classify(response: RawResponse) -> Result<Value, CallError> {
    let status = response.status;
    match status {
        200..=299 => {
            serde_json::from_slice(&response.body).map_err(|e| CallError::MalformedResponse {
                status,
                detail: e.to_string(),
            })
        }
        429 | 500..=599 => Err(CallError::Upstream {
            status,
            body: String::from_utf8_lossy(&response.body).into_owned(),
        }),
        400..=499 => {
            let body = serde_json::from_slice(&response.body).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&response.body).into_owned())
            });
            Err(CallError::ClientRejected { status, body })
        }
        _ => Err(CallError::MalformedResponse {
            status,
            detail: "unexpected HTTP status".to_string(),
        }),
    }
}
