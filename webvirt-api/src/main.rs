use anyhow::Result;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use webvirt_api::{create_app, AppState, Config};
use webvirt_logging::{init_subscriber, LogOptions};
use webvirt_orchestrator::db::{backup_database, create_pool, run_migrations};
use webvirt_orchestrator::ExpiryReaper;

#[tokio::main]
async fn main() -> Result<()> {
    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = init_subscriber(&LogOptions::from_env());

    info!("Starting webvirt-api service...");

    let config = Config::from_env();
    info!(
        bind_addr = %config.bind_addr,
        db_path = %config.db_path.display(),
        pve = %config.hypervisor.qemu_url(),
        ldap = %config.directory.url,
        "Configuration loaded"
    );

    // Backup before migrations
    if let Some(backup_path) = backup_database(&config.db_path)? {
        info!("Database backed up to: {}", backup_path.display());
    }

    let pool = create_pool(&config.db_path).await?;
    info!("Running database migrations...");
    run_migrations(&pool).await?;
    info!("Migrations complete");

    let state = AppState::from_config(pool, &config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = ExpiryReaper::new(
        state.orchestrator.clone(),
        Duration::from_secs(config.reaper_interval_secs.max(1)),
    );
    let reaper_handle = tokio::spawn(reaper.run(shutdown_rx));

    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped, waiting for the expiry reaper");
    let _ = shutdown_tx.send(true);
    if let Err(e) = reaper_handle.await {
        warn!(error = %e, "Expiry reaper task ended abnormally");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
