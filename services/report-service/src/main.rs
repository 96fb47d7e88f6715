use anyhow::{Context, Result};
use report_service::api::{start_api_server, AppState};
use report_service::{record_store, AttachmentStore, Config, CredentialService, ReportService};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Facility Report Service"
    );

    if config.service.metrics_port != 0 {
        init_metrics(config.service.metrics_port)?;
    }

    if config.uses_default_token_secret() {
        warn!("auth.token_secret is not set; staff tokens are signed with the development secret");
    }

    // Initialize components
    let store = record_store::open(&config.database)
        .await
        .context("Failed to initialize record store")?;

    let attachments = Arc::new(
        AttachmentStore::new(&config.uploads.directory)
            .await
            .context("Failed to initialize attachment store")?,
    );

    let credentials = Arc::new(
        CredentialService::new(store.clone(), &config.auth.token_secret, config.token_ttl())
            .context("Failed to initialize credential service")?,
    );

    // Seed the bootstrap staff credential before accepting traffic
    credentials
        .ensure_seed_credential(&config.auth.seed_username, &config.auth.seed_password)
        .await
        .context("Failed to seed staff credential")?;

    let reports = Arc::new(ReportService::new(store.clone(), attachments.clone()));

    let api_state = AppState {
        reports,
        credentials,
        store,
        attachments,
    };

    let shutdown = CancellationToken::new();

    // Spawn API server task
    let api_config = config.api.clone();
    let server_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, server_shutdown.cancelled_owned()).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Report service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down report service");

    shutdown.cancel();
    if let Err(e) = api_handle.await {
        error!(error = %e, "API server task failed");
    }

    info!("Report service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
