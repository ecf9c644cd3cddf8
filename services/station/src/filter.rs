//! Inbound message filtering: cycle suppression, trust shortcut, blocks.

use crate::accounts::AccountStore;
use dim_core::{EntityType, Id, ReliableMessage};
use tracing::{debug, warn};

/// Outcome of the traces check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceDecision {
    /// The message looped back to a station/broadcast destination.
    Drop,
    /// Continue processing; the local station is now in `traces`.
    Forward,
}

/// Cycle check on `traces`.
///
/// A message that has already passed this station is dropped when its
/// receiver is a station or broadcast destination (the loop would only
/// widen); any other message continues with the local station appended.
pub fn check_traces(
    local: &Id,
    accounts: &AccountStore,
    msg: &mut ReliableMessage,
) -> TraceDecision {
    if msg.has_traced(local) {
        let receiver = &msg.receiver;
        if receiver.is_broadcast() || accounts.entity_type(receiver) == EntityType::Station {
            warn!(
                sender = %msg.sender,
                receiver = %receiver,
                sig = %msg.fingerprint(),
                "cycled message dropped"
            );
            return TraceDecision::Drop;
        }
    }
    msg.add_trace(local);
    TraceDecision::Forward
}

/// Trust shortcut: signature verification is skipped for the session's
/// authenticated identifier and for neighbor stations.
pub fn is_trusted(
    session_identifier: Option<&Id>,
    sender: &Id,
    accounts: &AccountStore,
) -> bool {
    if session_identifier == Some(sender) {
        return true;
    }
    if accounts.is_neighbor(sender) {
        debug!(sender = %sender, "trusted neighbor station");
        return true;
    }
    false
}

/// True when the receiver has blocked the sender; blocked messages are
/// dropped silently.
pub fn is_blocked(accounts: &AccountStore, msg: &ReliableMessage) -> bool {
    if msg.receiver.is_broadcast() {
        return false;
    }
    accounts.is_blocked(&msg.sender, &msg.receiver)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as B64;

    fn accounts(dir: &std::path::Path) -> AccountStore {
        let db = DatabaseConfig {
            root: dir.to_path_buf(),
            public: dir.join("public"),
            private: dir.join("private"),
        };
        AccountStore::open(
            &db,
            Id::station("gsp", "s001"),
            &[],
            &[crate::config::NeighborConfig {
                host: "10.0.0.2".to_owned(),
                port: 9394,
                id: Id::station("gsp", "s002"),
                chosen: 0,
            }],
        )
        .unwrap()
    }

    fn message(receiver: &str) -> ReliableMessage {
        ReliableMessage {
            sender: "alice@a1".parse().unwrap(),
            receiver: receiver.parse().unwrap(),
            time: 1.0,
            msg_type: None,
            group: None,
            data: B64.encode(b"x"),
            signature: B64.encode(b"sig-filter"),
            key: None,
            keys: None,
            traces: Vec::new(),
            recipients: Vec::new(),
            target: None,
            neighbor: None,
            meta: None,
            visa: None,
        }
    }

    #[test]
    fn fresh_message_gets_trace_appended() {
        let dir = tempfile::tempdir().unwrap();
        let accounts = accounts(dir.path());
        let local = Id::station("gsp", "s001");
        let mut msg = message("bob@b1");
        assert_eq!(
            check_traces(&local, &accounts, &mut msg),
            TraceDecision::Forward
        );
        assert_eq!(msg.traces, vec!["gsp@s001"]);
        // Processing the same message twice never duplicates the trace.
        check_traces(&local, &accounts, &mut msg);
        assert_eq!(msg.traces, vec!["gsp@s001"]);
    }

    #[test]
    fn cycled_broadcast_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let accounts = accounts(dir.path());
        let local = Id::station("gsp", "s001");
        let mut msg = message("stations@everywhere");
        msg.add_trace(&local);
        assert_eq!(
            check_traces(&local, &accounts, &mut msg),
            TraceDecision::Drop
        );
    }

    #[test]
    fn cycled_station_receiver_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let accounts = accounts(dir.path());
        let local = Id::station("gsp", "s001");
        let mut msg = message("gsp@s002");
        msg.add_trace(&local);
        assert_eq!(
            check_traces(&local, &accounts, &mut msg),
            TraceDecision::Drop
        );
    }

    #[test]
    fn cycled_user_message_still_forwards() {
        let dir = tempfile::tempdir().unwrap();
        let accounts = accounts(dir.path());
        let local = Id::station("gsp", "s001");
        let mut msg = message("bob@b1");
        msg.add_trace(&local);
        assert_eq!(
            check_traces(&local, &accounts, &mut msg),
            TraceDecision::Forward
        );
        assert_eq!(msg.traces.len(), 1);
    }

    #[test]
    fn trust_covers_bound_identifier_and_neighbors() {
        let dir = tempfile::tempdir().unwrap();
        let accounts = accounts(dir.path());
        let alice: Id = "alice@a1".parse().unwrap();
        let neighbor: Id = "gsp@s002".parse().unwrap();
        let stranger: Id = "mallory@m1".parse().unwrap();
        assert!(is_trusted(Some(&alice), &alice, &accounts));
        assert!(is_trusted(None, &neighbor, &accounts));
        assert!(!is_trusted(Some(&alice), &stranger, &accounts));
    }
}
