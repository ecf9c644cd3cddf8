// station: DIM network station server.
//
// Accepts client connections on one port (MTP / Mars / WebSocket framing),
// authenticates sessions, and routes ciphertext messages.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "station", about = "DIM network station server")]
struct Args {
    /// Path to the station TOML config.
    #[arg(long, default_value = "/etc/dim/station.toml")]
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
    info!(version = env!("CARGO_PKG_VERSION"), "station starting");

    let config = match station::config::load_config_from_path(&args.config) {
        Ok(cfg) => {
            info!(
                station = %cfg.server.id,
                port = cfg.server.port,
                neighbors = cfg.neighbors.len(),
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let (station, workers) = match station::state::Station::new(config, None, None) {
        Ok(built) => built,
        Err(e) => {
            eprintln!("FATAL: failed to open account database: {}", e);
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handles = station.spawn_workers(workers, shutdown_rx.clone());

    let listener = tokio::spawn(station::listener::run_listener(
        Arc::clone(&station),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = listener.await;
    for handle in worker_handles {
        let _ = handle.await;
    }
    info!("station stopped");
}
