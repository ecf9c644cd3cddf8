//! Station-local command processors.
//!
//! A registry of handlers keyed by command name; each handler is a pure
//! function of `(station, session?, command, message)` returning the
//! response commands.  The session is absent when a command arrives via a
//! broadcast local copy (e.g. a login announcement relayed by a peer
//! station).

use crate::session::{Bind, SessionHandle};
use crate::state::Station;
use dim_core::{AnsCommand, Command, DocumentCommand, HandshakeTitle, Id};
use dim_core::ReliableMessage;
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, info, warn};

pub type CommandHandler =
    fn(&Station, Option<&SessionHandle>, &Command, &ReliableMessage) -> Vec<Command>;

pub struct CommandProcessor {
    handlers: HashMap<&'static str, CommandHandler>,
}

impl CommandProcessor {
    /// The standard station command set.
    pub fn standard() -> CommandProcessor {
        let mut handlers: HashMap<&'static str, CommandHandler> = HashMap::new();
        handlers.insert("handshake", handle_handshake);
        handlers.insert("login", handle_login);
        handlers.insert("report", handle_report);
        handlers.insert("document", handle_document);
        handlers.insert("ans", handle_ans);
        handlers.insert("receipt", handle_receipt);
        CommandProcessor { handlers }
    }

    pub fn process(
        &self,
        station: &Station,
        session: Option<&SessionHandle>,
        command: &Command,
        msg: &ReliableMessage,
    ) -> Vec<Command> {
        match self.handlers.get(command.name()) {
            Some(handler) => handler(station, session, command, msg),
            None => {
                warn!(command = command.name(), "no handler registered");
                Vec::new()
            }
        }
    }
}

fn now() -> f64 {
    chrono::Utc::now().timestamp() as f64
}

// ---------------------------------------------------------------------------
// handshake
// ---------------------------------------------------------------------------

/// Server side of the four-step handshake.
///
/// A `Hello world!` carrying this session's key binds the sender as the
/// session identifier and answers `DIM!`; anything else re-issues `DIM?`
/// with the current key.
fn handle_handshake(
    station: &Station,
    session: Option<&SessionHandle>,
    command: &Command,
    msg: &ReliableMessage,
) -> Vec<Command> {
    let Command::Handshake(hs) = command else {
        return Vec::new();
    };
    let Some(session) = session else {
        return Vec::new();
    };
    match hs.title {
        HandshakeTitle::Hello => {
            if hs.session.as_deref() == Some(session.state.key.as_str()) {
                // Respond leg: bind and accept.
                let sender = msg.sender.clone();
                match session.state.bind_identifier(&sender) {
                    Bind::First | Bind::Unchanged => {}
                    Bind::Replaced(old) => {
                        station.center.remove(&old, &session.state.key);
                        info!(old = %old, new = %sender, "session rebound");
                    }
                }
                station.center.insert(&sender, session.clone());
                session.state.set_active(true, now());
                crate::session::reload_offline(station, session);
                info!(user = %sender, key = %session.state.key, "handshake accepted");
                vec![Command::handshake_success()]
            } else {
                // Offer leg (or stale key): challenge with the current key.
                debug!(key = %session.state.key, "handshake challenge issued");
                vec![Command::handshake_again(&session.state.key)]
            }
        }
        // `DIM?` / `DIM!` are station-to-client; a client echoing them is noise.
        HandshakeTitle::Again | HandshakeTitle::Success => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// login
// ---------------------------------------------------------------------------

/// Persist the login command, mark the user online here, and trigger a
/// roaming replay when the user is attached elsewhere and has stored
/// messages waiting.
fn handle_login(
    station: &Station,
    session: Option<&SessionHandle>,
    command: &Command,
    msg: &ReliableMessage,
) -> Vec<Command> {
    let Command::Login(login) = command else {
        return Vec::new();
    };
    if login.id != msg.sender {
        warn!(sender = %msg.sender, claimed = %login.id, "login for someone else dropped");
        return Vec::new();
    }
    let envelope = json!({
        "sender": msg.sender,
        "receiver": msg.receiver,
        "time": msg.time,
    });
    match station.accounts.save_login(login.clone(), envelope) {
        Ok(true) => {
            let roaming = login.station.id.clone();
            if roaming != station.id && station.store.count(&login.id) > 0 {
                station.dispatcher.add_roaming(login.id.clone(), roaming);
            }
        }
        Ok(false) => debug!(user = %login.id, "stale login ignored"),
        Err(e) => warn!(user = %login.id, error = %e, "login not persisted"),
    }
    if let Some(session) = session {
        // An authenticated login may rebind the session to the new user.
        match session.state.bind_identifier(&login.id) {
            Bind::First | Bind::Unchanged => {}
            Bind::Replaced(old) => {
                station.center.remove(&old, &session.state.key);
                info!(old = %old, new = %login.id, "session rebound by login");
            }
        }
        station.center.insert(&login.id, session.clone());
        let flipped = session.state.set_active(true, login.time);
        if flipped {
            crate::session::reload_offline(station, session);
        }
        vec![Command::receipt("Login received", None)]
    } else {
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// report
// ---------------------------------------------------------------------------

/// Flip the session's active flag; flipping online reloads the offline
/// queue for the bound user.
fn handle_report(
    station: &Station,
    session: Option<&SessionHandle>,
    command: &Command,
    msg: &ReliableMessage,
) -> Vec<Command> {
    let Command::Report(report) = command else {
        return Vec::new();
    };
    let Some(session) = session else {
        return Vec::new();
    };
    let when = report.time.unwrap_or(msg.time);
    let flipped = session.state.set_active(report.is_online(), when);
    if flipped && report.is_online() && session.state.identifier().is_some() {
        crate::session::reload_offline(station, session);
    }
    debug!(
        online = report.is_online(),
        flipped,
        key = %session.state.key,
        "report processed"
    );
    vec![Command::receipt("Report received", None)]
}

// ---------------------------------------------------------------------------
// document
// ---------------------------------------------------------------------------

/// Document query/response.  A query for the station returns its meta and
/// visa so pre-authenticated clients can verify subsequent frames.
fn handle_document(
    station: &Station,
    _session: Option<&SessionHandle>,
    command: &Command,
    _msg: &ReliableMessage,
) -> Vec<Command> {
    let Command::Document(doc) = command else {
        return Vec::new();
    };
    match &doc.document {
        Some(document) => {
            let doc_type = document
                .get("type")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("profile")
                .to_owned();
            if let Some(meta) = &doc.meta {
                let _ = station.accounts.save_meta(&doc.id, meta.clone());
            }
            match station.accounts.save_document(&doc.id, &doc_type, document.clone()) {
                Ok(()) => vec![Command::receipt("Document received", None)],
                Err(e) => {
                    warn!(id = %doc.id, error = %e, "document rejected");
                    Vec::new()
                }
            }
        }
        None => {
            let id = doc.id.clone();
            let (meta, document) = if id == station.id {
                (station.accounts.station_meta(), station.accounts.station_visa())
            } else {
                (station.accounts.meta(&id), station.accounts.document(&id, "visa"))
            };
            match document.or_else(|| meta.clone()) {
                Some(document) => vec![Command::Document(DocumentCommand {
                    id,
                    document: Some(document),
                    meta,
                })],
                None => vec![Command::receipt("Document not found", None)],
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ans
// ---------------------------------------------------------------------------

/// Resolve well-known names to IDs.
fn handle_ans(
    station: &Station,
    _session: Option<&SessionHandle>,
    command: &Command,
    _msg: &ReliableMessage,
) -> Vec<Command> {
    let Command::Ans(ans) = command else {
        return Vec::new();
    };
    if ans.names.is_empty() {
        return Vec::new();
    }
    let records = station.accounts.ans_records(&ans.names);
    vec![Command::Ans(AnsCommand {
        names: ans.names.clone(),
        records: Some(records),
    })]
}

// ---------------------------------------------------------------------------
// receipt
// ---------------------------------------------------------------------------

/// Receipts from clients need no reply.
fn handle_receipt(
    _station: &Station,
    _session: Option<&SessionHandle>,
    _command: &Command,
    _msg: &ReliableMessage,
) -> Vec<Command> {
    Vec::new()
}

// ---------------------------------------------------------------------------
// Helpers for processors that need the station identity
// ---------------------------------------------------------------------------

/// The id the local station answers commands for.
pub fn is_local_command_target(station: &Station, receiver: &Id) -> bool {
    receiver == &station.id || receiver == &Id::any_station() || receiver == &Id::anyone()
}
