use serde::{Deserialize, Serialize};
use std::time::Instant;
use utoipa::ToSchema;

use crate::providers::CircuitState;
use crate::services::Reconciler;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// `healthy`, or `degraded` while any provider circuit is not closed.
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub store: StoreHealth,
    pub circuit_breakers: CircuitBreakers,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StoreHealth {
    pub records: usize,
    pub path: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CircuitBreakers {
    pub payment_gateway: String,
    pub fulfillment: String,
}

fn breaker_label(state: Option<CircuitState>) -> String {
    state.unwrap_or(CircuitState::Closed).as_str().to_string()
}

pub async fn check_health(reconciler: &Reconciler, start_time: Instant) -> HealthResponse {
    let gateway = reconciler.gateway_circuit();
    let fulfillment = reconciler.fulfillment_circuit();
    let store = reconciler.store();

    HealthResponse {
        status: determine_overall_status(&[gateway, fulfillment]).to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: start_time.elapsed().as_secs(),
        store: StoreHealth {
            records: store.len().await,
            path: store.path().map(|p| p.display().to_string()),
        },
        circuit_breakers: CircuitBreakers {
            payment_gateway: breaker_label(gateway),
            fulfillment: breaker_label(fulfillment),
        },
    }
}

fn determine_overall_status(breakers: &[Option<CircuitState>]) -> &'static str {
    let degraded = breakers
        .iter()
        .flatten()
        .any(|state| *state != CircuitState::Closed);

    if degraded {
        "degraded"
    } else {
        "healthy"
    }
}
