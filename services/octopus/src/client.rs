//! Client session: one WebSocket link to one station.
//!
//! Runs the client-side session state machine:
//!
//! ```text
//! Default -> Connecting -> Connected -> Handshaking -> Running
//!     (Error from any connected state, back to Default when it clears)
//! ```
//!
//! Transitions are evaluated on a periodic tick and on link events.  On
//! entering Handshaking the session sends the handshake offer; in
//! Handshaking longer than the timeout it falls back to Connected and
//! retries.  On entering Running it announces the local identity's
//! meta+visa and starts the keep-online reports.

use crate::config::TuningConfig;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use dim_core::{Command, DocumentCommand, HandshakeTitle, Id, ReliableMessage, ReportCommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Session status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Default,
    Connecting,
    Connected,
    Handshaking,
    Running,
    Error,
}

/// Link-level condition feeding the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStatus {
    Preparing,
    Ready,
    Error,
}

/// One state-machine step.  Pure: all inputs explicit, no clocks inside.
pub fn next_status(
    current: SessionStatus,
    gate: GateStatus,
    has_identifier: bool,
    has_key: bool,
    in_state: Duration,
    handshake_timeout: Duration,
) -> SessionStatus {
    if gate == GateStatus::Error {
        return SessionStatus::Error;
    }
    match current {
        SessionStatus::Default => {
            if has_identifier && matches!(gate, GateStatus::Ready | GateStatus::Preparing) {
                SessionStatus::Connecting
            } else {
                SessionStatus::Default
            }
        }
        SessionStatus::Connecting => {
            if gate == GateStatus::Ready {
                SessionStatus::Connected
            } else {
                SessionStatus::Connecting
            }
        }
        SessionStatus::Connected => {
            if has_key {
                SessionStatus::Connected
            } else {
                SessionStatus::Handshaking
            }
        }
        SessionStatus::Handshaking => {
            if has_key {
                SessionStatus::Running
            } else if in_state > handshake_timeout && gate == GateStatus::Ready {
                SessionStatus::Connected
            } else {
                SessionStatus::Handshaking
            }
        }
        SessionStatus::Running => {
            if has_key {
                SessionStatus::Running
            } else {
                // Key cleared: user switch, start over.
                SessionStatus::Default
            }
        }
        SessionStatus::Error => SessionStatus::Default,
    }
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

/// Everything one link needs to speak for the local identity.
#[derive(Clone)]
pub struct LinkConfig {
    /// Who this edge logs in as (the local station's ID).
    pub identity: Id,
    /// The station this link connects to.
    pub station: Id,
    pub url: String,
    pub secret: Vec<u8>,
    /// Announced on entering Running, when present.
    pub meta: Option<Value>,
    pub visa: Option<Value>,
    pub tuning: TuningConfig,
}

/// Messages surfaced by a link: the station it came from plus the envelope.
#[derive(Debug)]
pub struct LinkInbound {
    pub station: Id,
    pub msg: ReliableMessage,
}

fn sign(secret: &[u8], data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.update(secret);
    hasher.finalize().to_vec()
}

/// Build a signed command message from the local identity to `to`.
pub fn pack_command(cfg: &LinkConfig, to: &Id, command: &Command) -> ReliableMessage {
    let data = serde_json::to_vec(command).unwrap_or_default();
    let signature = sign(&cfg.secret, &data);
    ReliableMessage {
        sender: cfg.identity.clone(),
        receiver: to.clone(),
        time: chrono::Utc::now().timestamp() as f64,
        msg_type: Some(0x88),
        group: None,
        data: B64.encode(&data),
        signature: B64.encode(&signature),
        key: None,
        keys: None,
        traces: Vec::new(),
        recipients: Vec::new(),
        target: None,
        neighbor: None,
        meta: cfg.meta.clone(),
        visa: None,
    }
}

/// Extract a command from a message when its payload is plaintext JSON.
fn parse_command(msg: &ReliableMessage) -> Option<Command> {
    let data = msg.data_bytes().ok()?;
    serde_json::from_slice(&data).ok()
}

/// Run one station link until shutdown: connect, handshake, pump
/// messages, reconnect on failure.
pub async fn run_link(
    cfg: LinkConfig,
    inbound: mpsc::Sender<LinkInbound>,
    mut outbound: mpsc::Receiver<ReliableMessage>,
    running_tx: watch::Sender<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let reconnect = Duration::from_secs(cfg.tuning.reconnect_secs);
    loop {
        if *shutdown.borrow() {
            break;
        }
        match run_connection(&cfg, &inbound, &mut outbound, &running_tx, &mut shutdown).await {
            Ok(()) => break,
            Err(e) => {
                let _ = running_tx.send(false);
                warn!(station = %cfg.station, error = %e, "link failed, reconnecting");
            }
        }
        tokio::select! {
            _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
            () = tokio::time::sleep(reconnect) => {}
        }
    }
    let _ = running_tx.send(false);
    info!(station = %cfg.station, "link stopped");
}

#[derive(Debug, thiserror::Error)]
enum LinkError {
    #[error("WS: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection closed")]
    Closed,
}

async fn run_connection(
    cfg: &LinkConfig,
    inbound: &mpsc::Sender<LinkInbound>,
    outbound: &mut mpsc::Receiver<ReliableMessage>,
    running_tx: &watch::Sender<bool>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), LinkError> {
    let (mut ws, _response) = tokio_tungstenite::connect_async(&cfg.url).await?;
    info!(station = %cfg.station, url = %cfg.url, "link connected");

    let mut status = SessionStatus::Connected;
    let mut since = Instant::now();
    let mut session_key: Option<String> = None;
    let handshake_timeout = Duration::from_secs(cfg.tuning.handshake_timeout_secs);
    let mut tick = tokio::time::interval(Duration::from_millis(cfg.tuning.tick_millis));
    let mut keepalive = tokio::time::interval(Duration::from_secs(cfg.tuning.keepalive_secs));
    keepalive.reset();
    // Messages handed to us before the handshake completed.
    let mut parked: Vec<ReliableMessage> = Vec::new();

    loop {
        // Evaluate the state machine; act on entry into a new state.
        let next = next_status(
            status,
            GateStatus::Ready,
            true,
            session_key.is_some(),
            since.elapsed(),
            handshake_timeout,
        );
        if next != status {
            debug!(station = %cfg.station, from = ?status, to = ?next, "session state");
            status = next;
            since = Instant::now();
            match status {
                SessionStatus::Handshaking => {
                    let offer = pack_command(cfg, &cfg.station, &Command::handshake_hello(None));
                    send_message(&mut ws, &offer).await?;
                }
                SessionStatus::Running => {
                    let _ = running_tx.send(true);
                    announce(cfg, &mut ws).await?;
                    keepalive.reset();
                    for msg in parked.drain(..) {
                        send_message(&mut ws, &msg).await?;
                    }
                }
                _ => {}
            }
            continue;
        }

        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = ws.close(None).await;
                    return Ok(());
                }
            }
            _ = tick.tick() => {}
            _ = keepalive.tick(), if status == SessionStatus::Running => {
                let report = Command::Report(ReportCommand {
                    title: "online".to_owned(),
                    time: Some(chrono::Utc::now().timestamp() as f64),
                });
                let msg = pack_command(cfg, &cfg.station, &report);
                send_message(&mut ws, &msg).await?;
                debug!(station = %cfg.station, "keep-online report sent");
            }
            out = outbound.recv() => {
                match out {
                    None => return Ok(()),
                    Some(msg) => {
                        if status == SessionStatus::Running {
                            send_message(&mut ws, &msg).await?;
                        } else {
                            parked.push(msg);
                        }
                    }
                }
            }
            frame = ws.next() => {
                match frame {
                    None => return Err(LinkError::Closed),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(Message::Binary(b))) => {
                        handle_frame(cfg, &b, &mut session_key, &mut ws, inbound).await?;
                    }
                    Some(Ok(Message::Text(t))) => {
                        handle_frame(cfg, t.as_bytes(), &mut session_key, &mut ws, inbound).await?;
                    }
                    Some(Ok(Message::Ping(d))) => { let _ = ws.send(Message::Pong(d)).await; }
                    Some(Ok(Message::Close(_))) => return Err(LinkError::Closed),
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

type WsStream<S> = tokio_tungstenite::WebSocketStream<S>;

async fn send_message<S>(ws: &mut WsStream<S>, msg: &ReliableMessage) -> Result<(), LinkError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    match msg.encode() {
        Ok(payload) => {
            ws.send(Message::Binary(payload.into())).await?;
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "outbound message failed to encode");
            Ok(())
        }
    }
}

/// Announce the local identity on entering Running.
async fn announce<S>(cfg: &LinkConfig, ws: &mut WsStream<S>) -> Result<(), LinkError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    if cfg.meta.is_none() && cfg.visa.is_none() {
        return Ok(());
    }
    let document = Command::Document(DocumentCommand {
        id: cfg.identity.clone(),
        document: cfg.visa.clone(),
        meta: cfg.meta.clone(),
    });
    let msg = pack_command(cfg, &Id::everyone(), &document);
    send_message(ws, &msg).await
}

/// One inbound frame: handshake commands feed the state machine, station
/// receipts are logged, everything else is surfaced to the bridge.
async fn handle_frame<S>(
    cfg: &LinkConfig,
    payload: &[u8],
    session_key: &mut Option<String>,
    ws: &mut WsStream<S>,
    inbound: &mpsc::Sender<LinkInbound>,
) -> Result<(), LinkError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let msg = match ReliableMessage::decode(payload) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(station = %cfg.station, error = %e, "undecodable frame from station");
            return Ok(());
        }
    };
    // Commands from the station to us drive the session itself.
    if msg.receiver == cfg.identity || msg.receiver == Id::any_station() {
        if let Some(command) = parse_command(&msg) {
            match command {
                Command::Handshake(hs) => match hs.title {
                    HandshakeTitle::Again => {
                        // Challenge: respond with the offered key.
                        let respond = pack_command(
                            cfg,
                            &cfg.station,
                            &Command::handshake_hello(hs.session.clone()),
                        );
                        send_message(ws, &respond).await?;
                        *session_key = hs.session;
                        debug!(station = %cfg.station, "handshake challenge answered");
                    }
                    HandshakeTitle::Success => {
                        info!(station = %cfg.station, "handshake accepted");
                    }
                    HandshakeTitle::Hello => {}
                },
                Command::Receipt(receipt) => {
                    debug!(station = %cfg.station, text = %receipt.text, "receipt");
                }
                other => {
                    debug!(station = %cfg.station, command = other.name(), "station command ignored");
                }
            }
            return Ok(());
        }
    }
    let _ = inbound
        .send(LinkInbound {
            station: cfg.station.clone(),
            msg,
        })
        .await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
