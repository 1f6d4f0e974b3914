use anyhow::Context;
use bundle_relay::cli::{self, Cli, Commands, StoreCommands};
use bundle_relay::config::Config;
use bundle_relay::providers::{HttpTransport, HubnetClient, PaystackClient, ReqwestTransport};
use bundle_relay::services::{spawn_retention_sweep, Reconciler};
use bundle_relay::store::TransactionStore;
use bundle_relay::{create_app, AppState};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Upper bound on how long shutdown waits for in-flight reconciliations.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Serve);
    let config = match command {
        Commands::Store(_) => Config::from_env_offline(),
        Commands::Serve | Commands::Config => Config::from_env(),
    }
    .context("Failed to load configuration")?;

    match command {
        Commands::Serve => serve(config).await,
        Commands::Config => cli::handle_config_validate(&config),
        Commands::Store(StoreCommands::Inspect { reference }) => {
            cli::handle_store_inspect(&config, reference.as_deref()).await
        }
        Commands::Store(StoreCommands::Cleanup { max_age_hours }) => {
            cli::handle_store_cleanup(&config, max_age_hours).await
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);

    let store = TransactionStore::open(&config.store_path, config.retention())
        .context("Failed to open transaction store")?;
    let flusher = store.spawn_flusher(config.store_flush_interval);
    let sweeper = spawn_retention_sweep(
        store.clone(),
        config.retention(),
        config.retention_sweep_interval,
    );

    let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new());
    let gateway = Arc::new(PaystackClient::from_config(&config, transport.clone()));
    let fulfillment = Arc::new(HubnetClient::from_config(&config, transport));
    tracing::info!(
        paystack = %config.paystack_base_url,
        hubnet = %config.hubnet_base_url,
        "Provider clients initialized"
    );

    let reconciler = Reconciler::new(store.clone(), gateway, fulfillment);
    let app = create_app(AppState::new(reconciler.clone(), config.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    tracing::info!("listening on {}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    tracing::info!("HTTP server stopped, draining in-flight reconciliations");
    if !reconciler.drain(DRAIN_TIMEOUT).await {
        tracing::warn!("Some reconciliations were still running at shutdown");
    }

    flusher.abort();
    sweeper.abort();
    store
        .shutdown()
        .await
        .context("Final store flush failed")?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
