use chrono::Duration as ChronoDuration;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::store::TransactionStore;

/// Periodically drops records older than `retention` and flushes the result.
pub fn spawn_retention_sweep(
    store: TransactionStore,
    retention: ChronoDuration,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(
            retention_hours = retention.num_hours(),
            interval_secs = interval.as_secs(),
            "Retention sweep started"
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            run_sweep(&store, retention).await;
        }
    })
}

pub async fn run_sweep(store: &TransactionStore, retention: ChronoDuration) -> usize {
    let removed = store.cleanup(retention).await;
    if removed > 0 {
        tracing::info!(removed, "Expired transactions removed");
        if let Err(e) = store.flush().await {
            tracing::warn!(error = %e, "Flush after retention sweep failed");
        }
    }
    removed
}
