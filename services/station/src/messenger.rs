//! Station messenger: verify, classify and decide for every inbound frame.
//!
//! Order of operations per message: block check, cycle check on `traces`,
//! trust shortcut / signature verification, destination classification,
//! session gate, then either the local command processor or the
//! dispatcher.  Responses are wrapped into station-signed messages; the
//! first reply to a pre-authenticated client carries the station's meta
//! and visa.

use crate::filter::{self, TraceDecision};
use crate::processor;
use crate::session::SessionHandle;
use crate::state::{Metrics, Station};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use dim_core::{Command, Id, ReliableMessage};
use tracing::{debug, warn};

/// Content type code for command contents.
const TYPE_COMMAND: u32 = 0x88;

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Process one inbound frame; returns encoded response messages for the
/// session to queue.
pub fn process_package(
    station: &Station,
    session: &SessionHandle,
    payload: &[u8],
) -> Vec<Vec<u8>> {
    let mut msg = match ReliableMessage::decode(payload) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, len = payload.len(), "undecodable frame dropped");
            return Vec::new();
        }
    };

    if filter::is_blocked(&station.accounts, &msg) {
        Metrics::bump(&station.metrics.blocked_dropped);
        debug!(sender = %msg.sender, receiver = %msg.receiver, "blocked message dropped");
        return Vec::new();
    }

    if filter::check_traces(&station.id, &station.accounts, &mut msg) == TraceDecision::Drop {
        Metrics::bump(&station.metrics.cycle_dropped);
        return Vec::new();
    }

    let identifier = session.state.identifier();
    if !filter::is_trusted(identifier.as_ref(), &msg.sender, &station.accounts)
        && !station.verifier.verify(&msg)
    {
        Metrics::bump(&station.metrics.verify_failed);
        warn!(sender = %msg.sender, sig = %msg.fingerprint(), "signature verification failed");
        return Vec::new();
    }

    let receiver = msg.receiver.clone();
    let first_contact =
        receiver == Id::any_station() || (receiver.is_broadcast() && receiver.is_group());

    let responses = if processor::is_local_command_target(station, &receiver) {
        process_commands(station, session, &msg)
    } else {
        // Session gate: everything beyond plaintext commands needs an
        // authenticated, active session.
        let authenticated = session.state.is_active() && identifier.is_some();
        if authenticated {
            station.dispatcher.deliver(station, msg.clone(), &receiver)
        } else {
            Metrics::bump(&station.metrics.suspended);
            debug!(sender = %msg.sender, sig = %msg.fingerprint(), "message suspended pending handshake");
            session.state.suspend(msg.clone());
            vec![Command::handshake_again(&session.state.key)]
        }
    };

    let mut packaged = pack_responses(station, session, &msg.sender, responses, first_contact);

    // A handshake may just have authenticated the session: re-drive
    // anything parked behind it.
    if session.state.is_active() && session.state.identifier().is_some() {
        packaged.extend(redrive_suspended(station, session));
    }
    packaged
}

// ---------------------------------------------------------------------------
// Command processing
// ---------------------------------------------------------------------------

fn process_commands(
    station: &Station,
    session: &SessionHandle,
    msg: &ReliableMessage,
) -> Vec<Command> {
    let data = match msg.data_bytes() {
        Ok(data) => data,
        Err(e) => {
            warn!(error = %e, "command data not base64");
            return Vec::new();
        }
    };
    match serde_json::from_slice::<Command>(&data) {
        Ok(command) => {
            debug!(command = command.name(), sender = %msg.sender, "command received");
            station
                .processor
                .process(station, Some(session), &command, msg)
        }
        Err(e) => {
            warn!(sender = %msg.sender, error = %e, "unparseable command dropped");
            Vec::new()
        }
    }
}

/// Re-process messages parked while the session was unauthenticated.
fn redrive_suspended(station: &Station, session: &SessionHandle) -> Vec<Vec<u8>> {
    let parked = session
        .state
        .take_suspended(station.config.tuning.suspend_ttl_secs);
    let mut out = Vec::new();
    for msg in parked {
        let receiver = msg.receiver.clone();
        let sender = msg.sender.clone();
        let responses = station.dispatcher.deliver(station, msg, &receiver);
        out.extend(pack_responses(station, session, &sender, responses, false));
    }
    out
}

// ---------------------------------------------------------------------------
// Response packaging
// ---------------------------------------------------------------------------

/// Wrap response commands into station-signed messages addressed to the
/// sender of the original message.  When `first_contact` is set the first
/// reply carries the station's meta and visa.
pub fn pack_responses(
    station: &Station,
    _session: &SessionHandle,
    to: &Id,
    responses: Vec<Command>,
    first_contact: bool,
) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    for (i, command) in responses.into_iter().enumerate() {
        let mut msg = pack_command(station, to, &command);
        if first_contact && i == 0 {
            msg.meta = station.accounts.station_meta();
            msg.visa = station.accounts.station_visa();
        }
        match msg.encode() {
            Ok(payload) => out.push(payload),
            Err(e) => warn!(error = %e, "response failed to encode"),
        }
    }
    out
}

/// Build one station-signed message carrying a command.
pub fn pack_command(station: &Station, to: &Id, command: &Command) -> ReliableMessage {
    let data = serde_json::to_vec(command).unwrap_or_default();
    let signature = station.signer.sign(&data);
    ReliableMessage {
        sender: station.id.clone(),
        receiver: to.clone(),
        time: chrono::Utc::now().timestamp() as f64,
        msg_type: Some(TYPE_COMMAND),
        group: None,
        data: B64.encode(&data),
        signature: B64.encode(&signature),
        key: None,
        keys: None,
        traces: vec![station.id.without_terminal()],
        recipients: Vec::new(),
        target: None,
        neighbor: None,
        meta: None,
        visa: None,
    }
}
