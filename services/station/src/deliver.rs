//! Deliver strategies: user, bot, group, broadcast, station.
//!
//! Each strategy is best-effort and returns the receipt commands the
//! messenger wraps back to the sender.  Nothing here retries and nothing
//! throws past the dispatcher: an undeliverable user message is stored
//! and notified, an undeliverable bot/station message is dropped with a
//! warning, broadcast messages are never persisted.

use crate::session::MsgRef;
use crate::state::{Metrics, Station};
use dim_core::{Command, Id, ReliableMessage};
use dim_protocol::Priority;
use serde_json::json;
use tracing::{debug, warn};

fn receipt_for(msg: &ReliableMessage, text: &str) -> Command {
    Command::receipt(
        text,
        Some(json!({
            "sender": msg.sender,
            "receiver": msg.receiver,
            "time": msg.time,
            "sig": msg.fingerprint(),
        })),
    )
}

/// Push one message to every active session of `receiver`.
/// Returns the number of sessions that accepted the push.  When
/// `from_store` is set, each push carries the store reference so the
/// entry is removed once the gate accepts the frame.
fn push_to_sessions(
    station: &Station,
    msg: &ReliableMessage,
    receiver: &Id,
    from_store: bool,
) -> usize {
    let sessions = station.center.active_sessions(receiver);
    if sessions.is_empty() {
        return 0;
    }
    let Ok(payload) = msg.encode() else {
        warn!(sig = %msg.fingerprint(), "message failed to encode for push");
        return 0;
    };
    for session in &sessions {
        let msg_ref = from_store.then(|| MsgRef {
            receiver: receiver.clone(),
            signature: msg.signature.clone(),
        });
        session.push_message(payload.clone(), Priority::NORMAL, msg_ref);
    }
    sessions.len()
}

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

pub fn deliver_user(station: &Station, msg: &ReliableMessage, receiver: &Id) -> Vec<Command> {
    // Broadcast copies are routed but never persisted.
    let persist = !msg.receiver.is_broadcast();
    if persist {
        // Store first: the entry is removed only when a session accepts
        // the frame, which is what makes delivery at-least-once.
        station.store.save(msg, receiver);
    }

    let pushed = push_to_sessions(station, msg, receiver, persist);
    if pushed > 0 {
        Metrics::bump(&station.metrics.delivered);
        debug!(receiver = %receiver, sessions = pushed, sig = %msg.fingerprint(), "pushed to active sessions");
        return vec![receipt_for(msg, "Message delivering")];
    }

    if persist && crate::roamer::redirect(station, msg, receiver) {
        Metrics::bump(&station.metrics.redirected);
        return vec![receipt_for(msg, "Message delivering")];
    }

    if !persist {
        Metrics::bump(&station.metrics.unresolvable_dropped);
        return Vec::new();
    }

    // Offline: already stored; notify out of band.
    Metrics::bump(&station.metrics.stored);
    station.pusher.notify_message(msg);
    vec![receipt_for(msg, "Message cached")]
}

// ---------------------------------------------------------------------------
// Bot
// ---------------------------------------------------------------------------

/// Bots receive like users but are never notified; an offline bot with no
/// roaming station simply does not get the message.
pub fn deliver_bot(station: &Station, msg: &ReliableMessage, receiver: &Id) -> Vec<Command> {
    let persist = !msg.receiver.is_broadcast();
    if persist {
        station.store.save(msg, receiver);
    }
    let pushed = push_to_sessions(station, msg, receiver, persist);
    if pushed > 0 {
        Metrics::bump(&station.metrics.delivered);
        return vec![receipt_for(msg, "Message delivering")];
    }
    if persist && crate::roamer::redirect(station, msg, receiver) {
        Metrics::bump(&station.metrics.redirected);
        return vec![receipt_for(msg, "Message delivering")];
    }
    if persist {
        station.store.remove(msg, receiver);
    }
    Metrics::bump(&station.metrics.unresolvable_dropped);
    warn!(receiver = %receiver, sig = %msg.fingerprint(), "bot offline, message dropped");
    Vec::new()
}

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

/// Group messages go to the group's assistant bot: the first online
/// assistant, else stored for the first-listed one.
pub fn deliver_group(station: &Station, msg: &ReliableMessage, receiver: &Id) -> Vec<Command> {
    let assistants = station.accounts.group_assistants(receiver);
    if assistants.is_empty() {
        Metrics::bump(&station.metrics.unresolvable_dropped);
        warn!(group = %receiver, "group has no assistant, message dropped");
        return Vec::new();
    }
    for assistant in &assistants {
        if station.center.is_online(assistant) {
            station.store.save(msg, assistant);
            let pushed = push_to_sessions(station, msg, assistant, true);
            if pushed > 0 {
                Metrics::bump(&station.metrics.delivered);
                debug!(group = %receiver, assistant = %assistant, "group message to assistant");
                return vec![receipt_for(msg, "Group message delivering")];
            }
            station.store.remove(msg, assistant);
        }
    }
    // No assistant online: park under the first-listed one.
    station.store.save(msg, &assistants[0]);
    Metrics::bump(&station.metrics.stored);
    vec![receipt_for(msg, "Group message cached")]
}

// ---------------------------------------------------------------------------
// Broadcast
// ---------------------------------------------------------------------------

/// Expand the recipient set and resubmit each concrete target to the
/// dispatcher.  Broadcast messages are never persisted.
pub fn deliver_broadcast(station: &Station, msg: &ReliableMessage, receiver: &Id) -> Vec<Command> {
    let mut expanded = msg.clone();
    let targets = station
        .broadcast
        .expand(&mut expanded, &station.id, &station.accounts, &station.center);

    if receiver == &Id::everyone() {
        // One copy stays local: broadcast commands (login announcements
        // and the like) are what the station itself consumes.
        Metrics::bump(&station.metrics.broadcast_local);
        if let Ok(data) = expanded.data_bytes() {
            if let Ok(command) = serde_json::from_slice::<Command>(&data) {
                let _ = station.processor.process(station, None, &command, &expanded);
            }
        }
    }

    debug!(
        receiver = %receiver,
        targets = targets.len(),
        sig = %msg.fingerprint(),
        "broadcast expanded"
    );
    for target in &targets {
        let _ = station.dispatcher.deliver(station, expanded.clone(), target);
    }
    if targets.is_empty() && receiver != &Id::everyone() {
        return Vec::new();
    }
    vec![receipt_for(msg, "Broadcast message delivering")]
}

// ---------------------------------------------------------------------------
// Station
// ---------------------------------------------------------------------------

/// Messages for another station: push to its live session here, else
/// hand to the bridge.  Never persisted.
pub fn deliver_station(station: &Station, msg: &ReliableMessage, receiver: &Id) -> Vec<Command> {
    let sessions = station.center.active_sessions(receiver);
    if !sessions.is_empty() {
        if let Ok(payload) = msg.encode() {
            sessions[0].push_message(payload, Priority::NORMAL, None);
            Metrics::bump(&station.metrics.delivered);
            return vec![receipt_for(msg, "Message delivering")];
        }
    }
    // Bridge sessions are bound to this station's own ID.
    let bridge = station.center.active_sessions(&station.id);
    if !bridge.is_empty() {
        let mut redirected = msg.clone();
        redirected.target = Some(receiver.clone());
        if let Ok(payload) = redirected.encode() {
            bridge[0].push_message(payload, Priority::NORMAL, None);
            Metrics::bump(&station.metrics.redirected);
            return vec![receipt_for(msg, "Message delivering")];
        }
    }
    Metrics::bump(&station.metrics.unresolvable_dropped);
    warn!(station = %receiver, sig = %msg.fingerprint(), "peer station unreachable, message dropped");
    Vec::new()
}
