use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lora_bridge::backend::{self, Backend as _};
use lora_bridge::config::Config;
use lora_bridge::forwarder::Forwarder;
use lora_bridge::integration::{self, Integration as _};
use lora_bridge::metadata::Metadata;

#[derive(Parser)]
#[command(name = "lora-bridge")]
#[command(about = "Bridge between LoRa gateways and an MQTT network server")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "lora-bridge.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // A missing file falls back to defaults; a malformed one is fatal.
    let config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        eprintln!(
            "Warning: config file {:?} not found, using default configuration",
            cli.config
        );
        Config::default()
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting lora-bridge");

    let metadata = Metadata::setup(&config.metadata);

    let (backend, events) = backend::setup(&config).await?;
    let (integration, commands) = integration::setup(&config).await?;

    Forwarder::setup(
        &config,
        backend.clone(),
        integration.clone(),
        metadata,
        events,
        commands,
    )
    .await?;

    info!("bridge running, press Ctrl+C to stop");
    wait_for_shutdown_signal().await?;
    warn!("shutting down bridge");

    // Backend first so no new events race the closing integration.
    backend.close().await?;
    integration.close().await?;

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
