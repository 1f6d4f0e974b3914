//! Circuit breaker shared by every call to one upstream provider.
//!
//! Calls go through [`CircuitBreaker::guard`]. Failsafe only leaves the open state when
//! asked whether a call is permitted, so [`CircuitBreaker::state`] asks it too; health
//! checks then see `half_open` once the cooldown has passed, without waiting for traffic.

use failsafe::futures::CircuitBreaker as FuturesCircuitBreaker;
use failsafe::{backoff, failure_policy, Config, Error as FailsafeError, Instrument, StateMachine};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::caller::CallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Mirrors failsafe's internal state transitions so they can be reported.
#[derive(Clone)]
struct StateObserver {
    name: Arc<str>,
    state: Arc<AtomicU8>,
    rejected: Arc<AtomicU64>,
}

impl StateObserver {
    fn set(&self, state: CircuitState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

impl Instrument for StateObserver {
    fn on_call_rejected(&self) {}

    fn on_open(&self) {
        tracing::warn!(breaker = %self.name, "Circuit breaker opened");
        self.set(CircuitState::Open);
    }

    fn on_half_open(&self) {
        tracing::info!(breaker = %self.name, "Circuit breaker half-open, probing upstream");
        self.set(CircuitState::HalfOpen);
    }

    fn on_closed(&self) {
        tracing::info!(breaker = %self.name, "Circuit breaker closed");
        self.set(CircuitState::Closed);
    }
}

type Policy = failure_policy::ConsecutiveFailures<backoff::EqualJittered>;

#[derive(Clone)]
pub struct CircuitBreaker {
    machine: StateMachine<Policy, StateObserver>,
    observer: StateObserver,
}

impl CircuitBreaker {
    /// Opens after `failure_threshold` consecutive failures and stays open for
    /// between `reset_timeout` and twice that before admitting a trial call.
    pub fn new(name: &str, failure_threshold: u32, reset_timeout: Duration) -> Self {
        let observer = StateObserver {
            name: Arc::from(name),
            state: Arc::new(AtomicU8::new(CircuitState::Closed as u8)),
            rejected: Arc::new(AtomicU64::new(0)),
        };
        let backoff = backoff::equal_jittered(reset_timeout, reset_timeout * 2);
        let policy = failure_policy::consecutive_failures(failure_threshold, backoff);
        let machine = Config::new()
            .failure_policy(policy)
            .instrument(observer.clone())
            .build();

        Self { machine, observer }
    }

    pub fn name(&self) -> &str {
        &self.observer.name
    }

    pub fn state(&self) -> CircuitState {
        if self.observed() == CircuitState::Open {
            // Moves failsafe to half-open when the cooldown is over.
            let _ = self.machine.is_call_permitted();
        }
        self.observed()
    }

    fn observed(&self) -> CircuitState {
        CircuitState::from_u8(self.observer.state.load(Ordering::SeqCst))
    }

    /// Number of calls short-circuited since start-up.
    pub fn rejected_calls(&self) -> u64 {
        self.observer.rejected.load(Ordering::Relaxed)
    }

    /// Runs one attempt through the breaker. Only errors that indicate the upstream
    /// itself is unhealthy count towards opening the circuit; a client error proves
    /// the provider is up.
    pub async fn guard<T, F>(&self, attempt: F) -> Result<T, CallError>
    where
        F: Future<Output = Result<T, CallError>>,
    {
        let result = self
            .machine
            .call_with(|e: &CallError| e.trips_breaker(), attempt)
            .await;

        match result {
            Ok(value) => Ok(value),
            Err(FailsafeError::Rejected) => {
                self.observer.rejected.fetch_add(1, Ordering::Relaxed);
                Err(CallError::CircuitOpen)
            }
            Err(FailsafeError::Inner(e)) => Err(e),
        }
    }
}
