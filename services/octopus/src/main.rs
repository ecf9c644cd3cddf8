// octopus: Station-to-station bridge (edge node).
//
// Maintains one client session to the local station and one to each
// configured peer, relaying messages between them.

use clap::Parser;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "octopus", about = "DIM station-to-station bridge")]
struct Args {
    /// Path to the octopus TOML config.
    #[arg(long, default_value = "/etc/dim/octopus.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "octopus starting");

    let config = match octopus::config::load_config_from_path(&args.config) {
        Ok(cfg) => {
            info!(
                station = %cfg.station.id,
                peers = cfg.peers.len(),
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let bridge = octopus::bridge::Bridge::start(&config, shutdown_rx.clone());
    let runner = tokio::spawn(bridge.run(shutdown_rx));

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    let _ = runner.await;
    info!("octopus stopped");
}
