use clap::Parser;
use mimalloc::MiMalloc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use proxy_loadgen::cli::{init_tracing, Cli};
use proxy_loadgen::client::build_client;
use proxy_loadgen::config::LoadedConfig;
use proxy_loadgen::coordinator::{RunCoordinator, RunSettings};
use proxy_loadgen::transport::ReqwestTransport;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = LoadedConfig::load_or_default(&cli.config)?;
    let client = build_client(&config.client)?;

    let mut settings = RunSettings::new(cli.pattern_names(), cli.metrics_addr(), &config.generator);
    if let Some(cap) = cli.max_in_flight() {
        settings.max_in_flight = Some(cap);
    }
    settings.linger = cli.linger;

    info!(
        config = %cli.config.display(),
        patterns = ?settings.patterns,
        metrics_addr = %settings.metrics_addr,
        max_in_flight = ?settings.max_in_flight,
        vendors = ?config.vendors.names(),
        "Starting proxy load generator"
    );

    let coordinator = RunCoordinator::new(config, Arc::new(ReqwestTransport::new(client)), settings)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, shutting down");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });

    let report = coordinator.run(shutdown_rx).await?;
    info!(
        started = ?report.started,
        completed = ?report.completed,
        failed = ?report.failed,
        skipped = ?report.skipped,
        dispatched = report.total_dispatched(),
        "Load generator stopped"
    );

    Ok(())
}
