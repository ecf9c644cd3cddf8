//! Station-visible command contents.
//!
//! Commands are the only plaintext the station reads: handshake, login,
//! report, document and ans queries arrive addressed to the station itself
//! (or to a broadcast address) with JSON in the data field.  Everything the
//! station hands back to a client is also a command — receipts included.
//!
//! Wire form is a JSON object discriminated by the `command` field:
//!
//! ```json
//! { "command": "handshake", "title": "Hello world!", "session": "..." }
//! ```

use crate::id::Id;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// The three handshake titles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeTitle {
    /// Client offer / restart (steps 1 and 3).
    #[serde(rename = "Hello world!")]
    Hello,
    /// Station challenge carrying a fresh session key (step 2).
    #[serde(rename = "DIM?")]
    Again,
    /// Station acceptance (step 4).
    #[serde(rename = "DIM!")]
    Success,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeCommand {
    pub title: HandshakeTitle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

// ---------------------------------------------------------------------------
// Login
// ---------------------------------------------------------------------------

/// Where a user is attached: the station they logged in to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginStation {
    pub id: Id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// A signed statement of which station a user is currently attached to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginCommand {
    #[serde(rename = "ID")]
    pub id: Id,
    pub station: LoginStation,
    pub time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Client liveness report; flips the session's active flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportCommand {
    /// `"online"` or `"offline"`.
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
}

impl ReportCommand {
    pub fn is_online(&self) -> bool {
        self.title == "online"
    }
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// Document query/response: entity meta and visa documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentCommand {
    #[serde(rename = "ID")]
    pub id: Id,
    /// Present on responses; absent on queries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

// ---------------------------------------------------------------------------
// ANS
// ---------------------------------------------------------------------------

/// Address-Name Service query/response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnsCommand {
    /// Names being queried (space-separated on the wire in some variants;
    /// a list here).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
    /// Resolved records, present on responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records: Option<HashMap<String, Id>>,
}

// ---------------------------------------------------------------------------
// Receipt
// ---------------------------------------------------------------------------

/// Delivery receipt returned to the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptCommand {
    pub text: String,
    /// Envelope of the original message this receipt refers to, plus its
    /// signature fingerprint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Value>,
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// All command contents the station sends or understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum Command {
    Handshake(HandshakeCommand),
    Login(LoginCommand),
    Report(ReportCommand),
    Document(DocumentCommand),
    Ans(AnsCommand),
    Receipt(ReceiptCommand),
}

impl Command {
    /// Step 1/3: client offer, with the session key on the respond leg.
    pub fn handshake_hello(session: Option<String>) -> Command {
        Command::Handshake(HandshakeCommand {
            title: HandshakeTitle::Hello,
            session,
        })
    }

    /// Step 2: station challenge with a fresh session key.
    pub fn handshake_again(session: &str) -> Command {
        Command::Handshake(HandshakeCommand {
            title: HandshakeTitle::Again,
            session: Some(session.to_owned()),
        })
    }

    /// Step 4: station acceptance.
    pub fn handshake_success() -> Command {
        Command::Handshake(HandshakeCommand {
            title: HandshakeTitle::Success,
            session: None,
        })
    }

    /// A receipt for the given message fingerprint.
    pub fn receipt(text: &str, origin: Option<Value>) -> Command {
        Command::Receipt(ReceiptCommand {
            text: text.to_owned(),
            origin,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Handshake(_) => "handshake",
            Command::Login(_) => "login",
            Command::Report(_) => "report",
            Command::Document(_) => "document",
            Command::Ans(_) => "ans",
            Command::Receipt(_) => "receipt",
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
