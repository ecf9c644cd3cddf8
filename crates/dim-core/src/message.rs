//! Reliable message envelopes.
//!
//! A `ReliableMessage` is the signed ciphertext unit the station routes.
//! The station never reads `data` for user-to-user traffic; it reads and
//! rewrites only the transport metadata: `traces` (stations visited),
//! `recipients` (broadcast targets already enumerated), `target` (explicit
//! redirect set by the bridge) and `neighbor` (fan-out pin).
//!
//! `data` and `signature` travel base64-encoded.  The last 8 bytes of the
//! signature form the message's log fingerprint.

use crate::id::Id;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Error type for envelope encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The routing header of a message: who, to whom, when.
///
/// `sender` and `receiver` never change after signing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: Id,
    pub receiver: Id,
    /// Seconds since the Unix epoch, as the sender stamped it.
    pub time: f64,
}

// ---------------------------------------------------------------------------
// ReliableMessage
// ---------------------------------------------------------------------------

/// A signed ciphertext envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliableMessage {
    pub sender: Id,
    pub receiver: Id,
    pub time: f64,
    /// Content type hint (text/file/image/... or command); visible so the
    /// push center can synthesize a notification without the plaintext.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub msg_type: Option<u32>,
    /// Group this message belongs to, when split from a group conversation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<Id>,
    /// Base64 ciphertext (or plaintext JSON for broadcast commands).
    pub data: String,
    /// Base64 signature over the data.
    pub signature: String,
    /// Encrypted symmetric key for the receiver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Encrypted symmetric keys per member (group messages).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<HashMap<String, String>>,
    /// Stations this message has already passed, in order.  Append-only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traces: Vec<String>,
    /// Stations already enumerated during broadcast expansion.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<String>,
    /// Explicit redirect destination, set by the bridge for roaming users.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Id>,
    /// Pin outgoing bridge fan-out to exactly one peer station.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neighbor: Option<Id>,
    /// Sender meta, attached on first contact so the peer can verify
    /// subsequent frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    /// Sender visa document, attached alongside `meta`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visa: Option<serde_json::Value>,
}

impl ReliableMessage {
    pub fn envelope(&self) -> Envelope {
        Envelope {
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            time: self.time,
        }
    }

    /// True when `station` already appears in `traces`.
    pub fn has_traced(&self, station: &Id) -> bool {
        let key = station.without_terminal();
        self.traces.iter().any(|t| t == &key)
    }

    /// Append `station` to `traces`.  Callers must check `has_traced` first;
    /// the list is append-only and a station appears at most once.
    pub fn add_trace(&mut self, station: &Id) {
        let key = station.without_terminal();
        if !self.traces.iter().any(|t| t == &key) {
            self.traces.push(key);
        }
    }

    /// True when `station` is already in the enumerated `recipients` set.
    pub fn has_recipient(&self, station: &Id) -> bool {
        let key = station.without_terminal();
        self.recipients.iter().any(|r| r == &key)
    }

    /// Merge `targets` into `recipients` so downstream hops do not
    /// re-enumerate them.
    pub fn add_recipients<'a, I: IntoIterator<Item = &'a Id>>(&mut self, targets: I) {
        for t in targets {
            let key = t.without_terminal();
            if !self.recipients.iter().any(|r| r == &key) {
                self.recipients.push(key);
            }
        }
    }

    /// Raw signature bytes.
    pub fn signature_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(B64.decode(&self.signature)?)
    }

    /// Raw data bytes (ciphertext, or plaintext JSON for commands).
    pub fn data_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(B64.decode(&self.data)?)
    }

    /// Log fingerprint: lowercase hex of the last 8 signature bytes.
    ///
    /// Falls back to the tail of the base64 text when the signature does
    /// not decode; the fingerprint is for logs and dedup only.
    pub fn fingerprint(&self) -> String {
        match self.signature_bytes() {
            Ok(bytes) => {
                let tail = &bytes[bytes.len().saturating_sub(8)..];
                tail.iter().map(|b| format!("{:02x}", b)).collect()
            }
            Err(_) => {
                let s = &self.signature;
                s[s.len().saturating_sub(16)..].to_owned()
            }
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<ReliableMessage, MessageError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn message(sender: &str, receiver: &str) -> ReliableMessage {
        ReliableMessage {
            sender: sender.parse().unwrap(),
            receiver: receiver.parse().unwrap(),
            time: 1_700_000_000.0,
            msg_type: Some(0x01),
            group: None,
            data: B64.encode(b"ciphertext"),
            signature: B64.encode(b"0123456789abcdef"),
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
    fn traces_are_append_only_and_deduplicated() {
        let mut msg = message("alice@a1", "bob@b1");
        let s1 = Id::station("gsp", "s001");
        let s2 = Id::station("gsp", "s002");
        msg.add_trace(&s1);
        msg.add_trace(&s2);
        msg.add_trace(&s1);
        assert_eq!(msg.traces, vec!["gsp@s001", "gsp@s002"]);
        assert!(msg.has_traced(&s1));
        assert!(!msg.has_traced(&Id::station("gsp", "s003")));
    }

    #[test]
    fn recipients_union_is_monotone() {
        let mut msg = message("alice@a1", "everyone@everywhere");
        let s1 = Id::station("gsp", "s001");
        let s2 = Id::station("gsp", "s002");
        msg.add_recipients([&s1]);
        let before = msg.recipients.clone();
        msg.add_recipients([&s1, &s2]);
        assert!(msg.recipients.starts_with(&before));
        assert_eq!(msg.recipients, vec!["gsp@s001", "gsp@s002"]);
        assert!(msg.has_recipient(&s2));
    }

    #[test]
    fn fingerprint_is_last_eight_signature_bytes() {
        let msg = message("alice@a1", "bob@b1");
        // signature bytes are b"0123456789abcdef"; last 8 are b"89abcdef"
        assert_eq!(msg.fingerprint(), "3839616263646566");
    }

    #[test]
    fn encode_decode_round_trip_preserves_metadata() {
        let mut msg = message("alice@a1", "bob@b1");
        msg.add_trace(&Id::station("gsp", "s001"));
        msg.target = Some("bob@b1".parse().unwrap());
        let bytes = msg.encode().unwrap();
        let back = ReliableMessage::decode(&bytes).unwrap();
        assert_eq!(back.sender, msg.sender);
        assert_eq!(back.receiver, msg.receiver);
        assert_eq!(back.traces, msg.traces);
        assert_eq!(back.target, msg.target);
        assert_eq!(back.signature, msg.signature);
    }

    #[test]
    fn absent_metadata_is_omitted_from_wire_form() {
        let msg = message("alice@a1", "bob@b1");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("traces"));
        assert!(!json.contains("recipients"));
        assert!(!json.contains("target"));
        assert!(!json.contains("neighbor"));
    }
}
