//! In-process station harness for integration tests.
//!
//! Boots a real `Station` against a temp account database and exposes
//! helpers to create pre-wired sessions, sign client messages the way
//! the digest verifier expects, and drain session queues the way the
//! gate writer would (resolving store references on accept).

use dim_core::{Command, Id, ReliableMessage};
use serde_json::Value;
use station::config::{NeighborConfig, StationConfig, TuningConfig};
use station::session::SessionHandle;
use station::state::{Station, Workers};
use std::sync::Arc;

/// A booted station plus the temp dir backing its account database.
pub struct TestStation {
    pub station: Arc<Station>,
    pub workers: Workers,
    _dir: tempfile::TempDir,
}

/// Boot a station `gsp@s001` with the given neighbors and ANS records.
pub fn boot(neighbors: &[&str], ans: &[(&str, &str)]) -> TestStation {
    boot_with(neighbors, ans, TuningConfig::default())
}

pub fn boot_with(neighbors: &[&str], ans: &[(&str, &str)], tuning: TuningConfig) -> TestStation {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = StationConfig {
        schema_version: 1,
        database: station::config::DatabaseConfig {
            root: dir.path().to_path_buf(),
            public: dir.path().join("public"),
            private: dir.path().join("private"),
        },
        server: station::config::ServerConfig {
            host: "127.0.0.1".to_owned(),
            port: 9394,
            id: Id::station("gsp", "s001"),
        },
        ans: ans
            .iter()
            .map(|(name, id)| {
                (
                    (*name).to_owned(),
                    id.parse::<Id>()
                        .expect("ans id")
                        .with_network(dim_core::EntityType::Bot),
                )
            })
            .collect(),
        neighbors: neighbors
            .iter()
            .map(|id| NeighborConfig {
                host: "10.0.0.2".to_owned(),
                port: 9394,
                id: id.parse::<Id>()
                    .expect("neighbor id")
                    .with_network(dim_core::EntityType::Station),
                chosen: 0,
            })
            .collect(),
        tuning,
    };
    let (station, workers) = Station::new(config, None, None).expect("station boot");
    TestStation {
        station,
        workers,
        _dir: dir,
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// A fresh unauthenticated session.
pub fn open_session(station: &Station) -> SessionHandle {
    SessionHandle::new(
        "127.0.0.1:50000".parse().expect("addr"),
        station.config.tuning.queue_capacity,
    )
}

/// A session already bound and active for `id`, registered in the center
/// (as if its handshake had completed).
pub fn bind_session(station: &Station, id: &str) -> SessionHandle {
    let id: Id = id.parse().expect("id");
    let handle = open_session(station);
    handle.state.bind_identifier(&id);
    handle.state.set_active(true, 1.0);
    station.center.insert(&id, handle.clone());
    handle
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// The digest the default verifier checks: SHA-256 over data ‖ key.
pub fn digest_sign(data: &[u8], key: &str) -> Vec<u8> {
    use sha2::Digest;
    let mut hasher = sha2::Sha256::new();
    hasher.update(data);
    hasher.update(key.as_bytes());
    hasher.finalize().to_vec()
}

fn b64(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// A signed ciphertext message (opaque payload).
pub fn ciphertext_message(sender: &str, receiver: &str, key: &str, body: &[u8]) -> ReliableMessage {
    ReliableMessage {
        sender: sender.parse().expect("sender"),
        receiver: receiver.parse().expect("receiver"),
        time: 1_700_000_000.0,
        msg_type: Some(0x01),
        group: None,
        data: b64(body),
        signature: b64(&digest_sign(body, key)),
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

/// A signed command message (plaintext JSON payload).
pub fn command_message(sender: &str, receiver: &str, key: &str, command: &Command) -> ReliableMessage {
    let body = serde_json::to_vec(command).expect("command json");
    let mut msg = ciphertext_message(sender, receiver, key, &body);
    msg.msg_type = Some(0x88);
    msg
}

/// Register a sender's meta so the digest verifier accepts their frames.
pub fn register_key(station: &Station, id: &str, key: &str) {
    let id: Id = id.parse().expect("id");
    station
        .accounts
        .save_meta(&id, serde_json::json!({ "key": key }))
        .expect("save meta");
}

// ---------------------------------------------------------------------------
// Driving the messenger
// ---------------------------------------------------------------------------

/// Feed one message through the messenger; returns the decoded responses.
pub fn process(
    station: &Station,
    session: &SessionHandle,
    msg: &ReliableMessage,
) -> Vec<ReliableMessage> {
    let payload = msg.encode().expect("encode");
    station::messenger::process_package(station, session, &payload)
        .iter()
        .map(|bytes| ReliableMessage::decode(bytes).expect("decode response"))
        .collect()
}

/// The command inside a (plaintext) response message.
pub fn command_of(msg: &ReliableMessage) -> Command {
    let data = msg.data_bytes().expect("data");
    serde_json::from_slice(&data).expect("command")
}

/// Drain a session's queue the way the gate writer would: every payload
/// entry is decoded, and store references are resolved as accepted.
pub fn accept_all(station: &Station, session: &SessionHandle) -> Vec<ReliableMessage> {
    let mut out = Vec::new();
    while let Some((departure, msg_ref)) = session.queue.try_pop() {
        if let Some(r) = msg_ref {
            station.store.remove_by_signature(&r.receiver, &r.signature);
        }
        if let dim_protocol::frame::DepartureBody::Payload(payload) = departure.body {
            out.push(ReliableMessage::decode(&payload).expect("decode queued"));
        }
    }
    out
}

/// Like [`accept_all`] but leaves the offline store untouched (the gate
/// never accepted anything).
pub fn peek_all(session: &SessionHandle) -> Vec<ReliableMessage> {
    let mut out = Vec::new();
    while let Some((departure, _)) = session.queue.try_pop() {
        if let dim_protocol::frame::DepartureBody::Payload(payload) = departure.body {
            out.push(ReliableMessage::decode(&payload).expect("decode queued"));
        }
    }
    out
}

/// Pull the handshake session key out of a `DIM?` response.
pub fn session_key_of(responses: &[ReliableMessage]) -> Option<String> {
    for msg in responses {
        if let Command::Handshake(hs) = command_of(msg) {
            if let Some(key) = hs.session {
                return Some(key);
            }
        }
    }
    None
}

/// The station meta/visa attachment of a response, if any.
pub fn attachments_of(msg: &ReliableMessage) -> (Option<Value>, Option<Value>) {
    (msg.meta.clone(), msg.visa.clone())
}
