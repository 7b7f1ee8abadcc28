//! Engine entrypoint: parses CLI args, loads YAML config, builds the orchestrator, and runs it
//! until SIGINT/SIGTERM (§6).

use clap::Parser;
use interop_core::cli::CommonArgs;
use interop_core::config::EngineConfig;
use interop_pipeline::Orchestrator;
use std::path::Path;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(interop_core::threading::default_worker_count())
        .enable_all()
        .build()?;
    runtime.block_on(run())
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = CommonArgs::parse();
    let config = EngineConfig::load(Path::new(&args.config), args.environment.as_deref())?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.global.log_level);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(config = %args.config, environment = ?args.environment, "loaded configuration");

    let mut orchestrator = Orchestrator::build(&config).await?;
    if args.dry_run {
        info!("dry run: orchestrator built successfully, exiting without starting");
        return Ok(());
    }

    orchestrator.start(&config).await?;
    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");
    orchestrator.stop().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
