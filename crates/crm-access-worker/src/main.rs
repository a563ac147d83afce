use std::sync::Arc;

use clap::Parser;
use crm_access_storage::PostgresStore;
use crm_access_storage::postgres::migrations;
use crm_access_worker::OutboxDispatcher;
use crm_access_worker::cli::{Cli, Command};
use crm_access_worker::config::{AppConfig, LogFormat};
use crm_access_worker::metrics::DispatcherMetrics;
use crm_access_worker::resync::resync_all;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));

    let registry = tracing_subscriber::registry().with(filter);

    match config.log.format {
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer().json();
            registry.with(fmt_layer).init();
        }
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer().pretty();
            registry.with(fmt_layer).init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref())?;
    init_logging(&config);

    match cli.command {
        Some(Command::Migrate) => run_migrate(&config).await,
        Some(Command::Resync) => run_resync(&config).await,
        Some(Command::Serve) | None => run_serve(config).await,
    }
}

async fn connect(config: &AppConfig) -> Result<PostgresStore, Box<dyn std::error::Error>> {
    let store =
        PostgresStore::connect(&config.database.url, config.database.max_connections).await?;
    Ok(store)
}

async fn run_migrate(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("running database migrations");
    let store = connect(config).await?;
    migrations::run_migrations(store.pool(), &config.dispatcher.channel).await?;
    tracing::info!("migrations completed successfully");
    Ok(())
}

async fn run_resync(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("rebuilding all effective caches");
    let store = Arc::new(connect(config).await?);
    let outcome = resync_all(store).await?;

    println!("Resync completed");
    println!("  Users recomputed: {}", outcome.succeeded);
    println!("  Users failed:     {}", outcome.failed);
    Ok(())
}

async fn run_serve(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(
        channel = %config.dispatcher.channel,
        max_connections = config.database.max_connections,
        "starting crm access worker"
    );

    let store = Arc::new(connect(&config).await?);
    let metrics = Arc::new(DispatcherMetrics::new());
    let dispatcher = OutboxDispatcher::new(store, config.to_dispatcher_config())
        .with_metrics(Arc::clone(&metrics));

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    dispatcher.run(cancel).await;

    tracing::info!(
        sweeps = metrics.sweeps(),
        events_processed = metrics.events_processed(),
        events_failed = metrics.events_failed(),
        "worker shut down gracefully"
    );
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => { tracing::info!("received SIGINT"); }
                _ = sigterm.recv() => { tracing::info!("received SIGTERM"); }
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to register SIGTERM handler, using SIGINT only");
            let _ = ctrl_c.await;
            tracing::info!("received SIGINT");
        }
    }

    cancel.cancel();
}
