//! Message signing and verification seams.
//!
//! Key formats and signature algorithms are external to the station; it
//! consumes them through these two traits.  The digest implementation
//! below binds a signature to the sender's registered meta key the same
//! way device tokens are matched against stored digests: compare against
//! a SHA-256 over the data and the key material.  Deployments with a
//! full crypto provider plug it in at boot.

use crate::accounts::AccountStore;
use dim_core::ReliableMessage;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

/// Verifies the signature of an inbound message against what the account
/// layer knows about the sender.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, msg: &ReliableMessage) -> bool;
}

/// Signs outbound station messages.
pub trait MessageSigner: Send + Sync {
    fn sign(&self, data: &[u8]) -> Vec<u8>;
}

// ---------------------------------------------------------------------------
// Digest-based implementation
// ---------------------------------------------------------------------------

fn digest(data: &[u8], key: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.update(key);
    hasher.finalize().to_vec()
}

/// Verifier backed by the sender's `meta.key` record.
pub struct MetaKeyVerifier {
    accounts: Arc<AccountStore>,
}

impl MetaKeyVerifier {
    pub fn new(accounts: Arc<AccountStore>) -> MetaKeyVerifier {
        MetaKeyVerifier { accounts }
    }
}

impl SignatureVerifier for MetaKeyVerifier {
    fn verify(&self, msg: &ReliableMessage) -> bool {
        // An attached meta is the sender's first contact; record it so
        // this and subsequent frames can be checked.
        if let Some(meta) = &msg.meta {
            let _ = self.accounts.save_meta(&msg.sender, meta.clone());
        }
        let Some(meta) = self.accounts.meta(&msg.sender) else {
            debug!(sender = %msg.sender, "no meta for sender");
            return false;
        };
        let Some(key) = meta.get("key").and_then(Value::as_str) else {
            debug!(sender = %msg.sender, "sender meta has no key");
            return false;
        };
        let Ok(data) = msg.data_bytes() else {
            return false;
        };
        let Ok(signature) = msg.signature_bytes() else {
            return false;
        };
        digest(&data, key.as_bytes()) == signature
    }
}

/// Signer using the station's identity key material.
pub struct StationSigner {
    secret: Vec<u8>,
}

impl StationSigner {
    pub fn new(secret: Vec<u8>) -> StationSigner {
        StationSigner { secret }
    }
}

impl MessageSigner for StationSigner {
    fn sign(&self, data: &[u8]) -> Vec<u8> {
        digest(data, &self.secret)
    }
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
    use dim_core::Id;
    use serde_json::json;

    fn store(dir: &std::path::Path) -> Arc<AccountStore> {
        let db = DatabaseConfig {
            root: dir.to_path_buf(),
            public: dir.join("public"),
            private: dir.join("private"),
        };
        Arc::new(AccountStore::open(&db, Id::station("gsp", "s001"), &[], &[]).unwrap())
    }

    fn signed_message(sender: &str, key: &str, payload: &[u8]) -> ReliableMessage {
        let signature = digest(payload, key.as_bytes());
        ReliableMessage {
            sender: sender.parse().unwrap(),
            receiver: "bob@b1".parse().unwrap(),
            time: 1.0,
            msg_type: None,
            group: None,
            data: B64.encode(payload),
            signature: B64.encode(signature),
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
    fn verifies_against_registered_meta_key() {
        let dir = tempfile::tempdir().unwrap();
        let accounts = store(dir.path());
        let alice: Id = "alice@a1".parse().unwrap();
        accounts.save_meta(&alice, json!({"key": "alice-key"})).unwrap();
        let verifier = MetaKeyVerifier::new(accounts);

        let good = signed_message("alice@a1", "alice-key", b"hello");
        assert!(verifier.verify(&good));

        let forged = signed_message("alice@a1", "wrong-key", b"hello");
        assert!(!verifier.verify(&forged));
    }

    #[test]
    fn attached_meta_enables_first_contact_verification() {
        let dir = tempfile::tempdir().unwrap();
        let accounts = store(dir.path());
        let verifier = MetaKeyVerifier::new(accounts.clone());

        let mut msg = signed_message("carol@c3", "carol-key", b"hi");
        msg.meta = Some(json!({"key": "carol-key"}));
        assert!(verifier.verify(&msg));
        // Meta was recorded; a later frame without the attachment verifies.
        let later = signed_message("carol@c3", "carol-key", b"again");
        assert!(verifier.verify(&later));
    }

    #[test]
    fn unknown_sender_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = MetaKeyVerifier::new(store(dir.path()));
        let msg = signed_message("nobody@n0", "k", b"x");
        assert!(!verifier.verify(&msg));
    }
}
