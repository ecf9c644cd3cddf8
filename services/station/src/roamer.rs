//! Roaming redirect: forward messages to the station a user is attached to.
//!
//! A user is roaming when their latest login command names a station other
//! than this one.  The redirect first tries a live session bound to that
//! neighbor station; failing that it rewrites `target` and pushes through
//! the bridge (a session bound to this station's own ID, consumed by the
//! octopus edge).

use crate::session::MsgRef;
use crate::state::Station;
use dim_core::{EntityType, Id, ReliableMessage};
use dim_protocol::Priority;
use tracing::{debug, warn};

/// Where the receiver currently resides, if known.
///
/// A station receiver roams to itself; a user roams to the station in
/// their login command.
pub fn roaming_station(station: &Station, receiver: &Id) -> Option<Id> {
    if station.accounts.entity_type(receiver) == EntityType::Station {
        return Some(receiver.clone());
    }
    station.accounts.roaming_station(receiver)
}

/// Try to redirect a message toward the receiver's roaming station.
///
/// Returns false when the receiver is local (or unknown) and local
/// delivery should continue.  `msg_ref` ties the push back to the offline
/// store entry so the message is removed once a session accepts it.
pub fn redirect(station: &Station, msg: &ReliableMessage, receiver: &Id) -> bool {
    let Some(roaming) = roaming_station(station, receiver) else {
        return false;
    };
    if roaming == station.id {
        return false;
    }
    push_roaming(station, msg, receiver, &roaming)
}

/// Push toward a known roaming station: directly to a neighbor session,
/// else via the bridge with `target` set.
pub fn push_roaming(
    station: &Station,
    msg: &ReliableMessage,
    receiver: &Id,
    roaming: &Id,
) -> bool {
    let msg_ref = MsgRef {
        receiver: receiver.clone(),
        signature: msg.signature.clone(),
    };

    // Direct: the roaming station keeps a session here.
    let direct = station.center.active_sessions(roaming);
    if !direct.is_empty() {
        match msg.encode() {
            Ok(payload) => {
                direct[0].push_message(payload, Priority::NORMAL, Some(msg_ref));
                debug!(receiver = %receiver, station = %roaming, "redirected to neighbor session");
                return true;
            }
            Err(e) => {
                warn!(error = %e, "roaming message failed to encode");
                return false;
            }
        }
    }

    // Bridge: sessions bound to this station's own ID belong to the edge.
    let bridge = station.center.active_sessions(&station.id);
    if bridge.is_empty() {
        return false;
    }
    let mut redirected = msg.clone();
    redirected.target = Some(receiver.clone());
    match redirected.encode() {
        Ok(payload) => {
            bridge[0].push_message(payload, Priority::NORMAL, Some(msg_ref));
            debug!(receiver = %receiver, station = %roaming, "redirected via bridge");
            true
        }
        Err(e) => {
            warn!(error = %e, "bridge message failed to encode");
            false
        }
    }
}
