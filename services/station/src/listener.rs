//! TCP accept loop: one gate task and one session task per connection.

use crate::session::{SessionHandle, run_session};
use crate::state::Station;
use dim_protocol::run_gate;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Per-connection channel depth between gate and session.
const CHANNEL_DEPTH: usize = 256;

/// Bind and accept until shutdown.
pub async fn run_listener(
    station: Arc<Station>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr = format!(
        "{}:{}",
        station.config.server.host, station.config.server.port
    );
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, station = %station.id, "station listening");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote)) => {
                        spawn_connection(station.clone(), stream, remote, shutdown.clone());
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }
    }
    info!("listener stopped");
    Ok(())
}

/// Wire up one accepted connection: gate task plus session task.
pub fn spawn_connection(
    station: Arc<Station>,
    stream: TcpStream,
    remote: SocketAddr,
    shutdown: watch::Receiver<bool>,
) {
    let handle = SessionHandle::new(remote, station.config.tuning.queue_capacity);
    debug!(remote = %remote, key = %handle.state.key, "connection accepted");

    let (arrival_tx, arrival_rx) = mpsc::channel(CHANNEL_DEPTH);
    let (departure_tx, departure_rx) = mpsc::channel(CHANNEL_DEPTH);

    let gate_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = run_gate(stream, arrival_tx, departure_rx, gate_shutdown).await {
            debug!(remote = %remote, error = %e, "gate closed with error");
        }
    });
    tokio::spawn(run_session(
        station,
        handle,
        arrival_rx,
        departure_tx,
        shutdown,
    ));
}
