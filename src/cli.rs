use clap::{Parser, Subcommand};
use serde_json::json;

use crate::config::Config;
use crate::handlers::payments::TransactionView;
use crate::store::TransactionStore;

#[derive(Parser)]
#[command(name = "bundle-relay")]
#[command(about = "Bundle Relay - payment to data-bundle fulfillment relay", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server (default)
    Serve,

    /// Validate configuration and print it with secrets masked
    Config,

    /// Offline transaction store commands
    #[command(subcommand)]
    Store(StoreCommands),
}

#[derive(Subcommand)]
pub enum StoreCommands {
    /// Print one transaction, or a summary of all of them
    Inspect {
        /// Transaction reference
        #[arg(value_name = "REFERENCE")]
        reference: Option<String>,
    },

    /// Remove transactions older than the retention horizon
    Cleanup {
        /// Override RETENTION_HOURS (never below 24)
        #[arg(long)]
        max_age_hours: Option<u64>,
    },
}

pub fn handle_config_validate(config: &Config) -> anyhow::Result<()> {
    tracing::info!("Validating configuration...");
    config.validate()?;

    println!("Configuration:");
    println!("  Port: {}", config.server_port);
    println!("  Public Base URL: {}", config.public_base_url);
    println!(
        "  Frontend Origin: {}",
        config.frontend_origin.as_deref().unwrap_or("(any)")
    );
    println!("  Paystack Base URL: {}", config.paystack_base_url);
    println!("  Paystack Secret Key: {}", mask_secret(&config.paystack_secret_key));
    println!("  Hubnet Base URL: {}", config.hubnet_base_url);
    println!("  Hubnet API Key: {}", mask_secret(&config.hubnet_api_key));
    println!(
        "  Admin API Key: {}",
        config
            .admin_api_key
            .as_deref()
            .map(mask_secret)
            .unwrap_or_else(|| "(not set, retry endpoint disabled)".to_string())
    );
    println!("  Store Path: {}", config.store_path.display());
    println!("  Store Flush Interval: {:?}", config.store_flush_interval);
    println!("  Retention: {}h", config.retention_hours);
    println!(
        "  Timeouts: payment {:?}, fulfillment {:?}",
        config.payment_timeout, config.fulfillment_timeout
    );
    println!(
        "  Retries: payment {}, fulfillment {} (backoff {:?}..{:?})",
        config.payment_max_retries,
        config.fulfillment_max_retries,
        config.retry_base_delay,
        config.retry_max_delay
    );
    println!(
        "  Circuit Breaker: {} failures, {:?} reset",
        config.breaker_failure_threshold, config.breaker_reset
    );

    tracing::info!("Configuration is valid");
    println!("✓ Configuration is valid");

    Ok(())
}

fn mask_secret(secret: &str) -> String {
    let visible: String = secret.chars().take(4).collect();
    if secret.chars().count() <= 8 {
        return "****".to_string();
    }
    format!("{}****", visible)
}

pub async fn handle_store_inspect(config: &Config, reference: Option<&str>) -> anyhow::Result<()> {
    let store = TransactionStore::open_read_only(&config.store_path, config.retention())?;

    match reference {
        Some(reference) => {
            let record = store
                .get(reference)
                .await
                .ok_or_else(|| anyhow::anyhow!("Transaction {} not found", reference))?;
            println!("{}", serde_json::to_string_pretty(&TransactionView::from(&record))?);
        }
        None => {
            let records = store.all().await;
            let mut by_phase = std::collections::BTreeMap::new();
            for record in &records {
                *by_phase.entry(record.phase.as_str()).or_insert(0usize) += 1;
            }
            let summary = json!({
                "path": config.store_path.display().to_string(),
                "records": records.len(),
                "phases": by_phase,
                "needsAttention": records
                    .iter()
                    .filter(|r| matches!(r.phase, crate::domain::Phase::FulfillmentFailed | crate::domain::Phase::Fulfilling))
                    .map(|r| r.reference.as_str())
                    .collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

pub async fn handle_store_cleanup(config: &Config, max_age_hours: Option<u64>) -> anyhow::Result<()> {
    let store = TransactionStore::open(&config.store_path, config.retention())?;
    let hours = max_age_hours.unwrap_or(config.retention_hours);

    let removed = store.cleanup(chrono::Duration::hours(hours as i64)).await;
    store.shutdown().await?;

    tracing::info!(removed, "Store cleanup completed");
    println!("✓ Removed {} transaction(s), {} remaining", removed, store.len().await);

    Ok(())
}
