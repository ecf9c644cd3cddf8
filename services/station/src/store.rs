//! Offline message store: per-receiver FIFO with a cap.
//!
//! Holds messages for receivers with no active session until a session
//! accepts them for sending.  Replay order is insertion order per
//! receiver; nothing is ordered across receivers.
//!
//! Deduplication key is the message signature.  Overflow drops from the
//! head (oldest) without surfacing an error; drops are counted so they
//! stay observable.  Station-to-station and broadcast messages are never
//! persisted — callers enforce that policy, this store only enforces the
//! FIFO contract.

use dim_core::{Id, ReliableMessage};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::warn;

// ---------------------------------------------------------------------------
// MessageStore
// ---------------------------------------------------------------------------

struct ReceiverQueue {
    fifo: VecDeque<ReliableMessage>,
    signatures: HashSet<String>,
}

pub struct MessageStore {
    shards: RwLock<HashMap<Id, Arc<Mutex<ReceiverQueue>>>>,
    cap: usize,
    dropped: AtomicU64,
}

impl MessageStore {
    pub fn new(cap: usize) -> MessageStore {
        MessageStore {
            shards: RwLock::new(HashMap::new()),
            cap,
            dropped: AtomicU64::new(0),
        }
    }

    fn shard(&self, receiver: &Id) -> Arc<Mutex<ReceiverQueue>> {
        if let Some(q) = self.shards.read().unwrap().get(receiver) {
            return q.clone();
        }
        let mut shards = self.shards.write().unwrap();
        shards
            .entry(receiver.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ReceiverQueue {
                    fifo: VecDeque::new(),
                    signatures: HashSet::new(),
                }))
            })
            .clone()
    }

    /// Append a message for `receiver`.  Idempotent by signature: returns
    /// false when the message is already stored.
    pub fn save(&self, msg: &ReliableMessage, receiver: &Id) -> bool {
        let shard = self.shard(receiver);
        let mut q = shard.lock().unwrap();
        if !q.signatures.insert(msg.signature.clone()) {
            return false;
        }
        q.fifo.push_back(msg.clone());
        if q.fifo.len() > self.cap {
            // Overflow: oldest goes first.
            if let Some(evicted) = q.fifo.pop_front() {
                q.signatures.remove(&evicted.signature);
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    receiver = %receiver,
                    sig = %evicted.fingerprint(),
                    dropped_total = total,
                    "offline store overflow, oldest dropped"
                );
            }
        }
        true
    }

    /// Remove a message by signature.  Idempotent: returns false when the
    /// message was not stored.
    pub fn remove(&self, msg: &ReliableMessage, receiver: &Id) -> bool {
        self.remove_by_signature(receiver, &msg.signature)
    }

    pub fn remove_by_signature(&self, receiver: &Id, signature: &str) -> bool {
        let shard = self.shard(receiver);
        let mut q = shard.lock().unwrap();
        if !q.signatures.remove(signature) {
            return false;
        }
        q.fifo.retain(|m| m.signature != signature);
        true
    }

    /// Fetch a contiguous slice of stored messages, in insertion order.
    ///
    /// `start` may be negative to count from the tail (-1 is the last
    /// message).  Returns the slice and the count of messages after it.
    pub fn fetch(&self, receiver: &Id, start: i64, limit: usize) -> (Vec<ReliableMessage>, usize) {
        let shard = self.shard(receiver);
        let q = shard.lock().unwrap();
        let len = q.fifo.len() as i64;
        let begin = if start < 0 {
            (len + start).max(0)
        } else {
            start.min(len)
        } as usize;
        let end = (begin + limit).min(len as usize);
        let slice: Vec<ReliableMessage> = q.fifo.iter().skip(begin).take(end - begin).cloned().collect();
        let remaining = len as usize - end;
        (slice, remaining)
    }

    pub fn count(&self, receiver: &Id) -> usize {
        let shard = self.shard(receiver);
        let n = shard.lock().unwrap().fifo.len();
        n
    }

    /// Total messages dropped to overflow since start.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as B64;

    fn message(n: u64) -> ReliableMessage {
        ReliableMessage {
            sender: "alice@a1".parse().unwrap(),
            receiver: "bob@b1".parse().unwrap(),
            time: n as f64,
            msg_type: None,
            group: None,
            data: B64.encode(format!("payload-{n}")),
            signature: B64.encode(format!("signature-{n:08}")),
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
    fn save_is_idempotent_by_signature() {
        let store = MessageStore::new(16);
        let bob: Id = "bob@b1".parse().unwrap();
        let msg = message(1);
        assert!(store.save(&msg, &bob));
        assert!(!store.save(&msg, &bob));
        assert_eq!(store.count(&bob), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let store = MessageStore::new(16);
        let bob: Id = "bob@b1".parse().unwrap();
        let msg = message(1);
        store.save(&msg, &bob);
        assert!(store.remove(&msg, &bob));
        assert!(!store.remove(&msg, &bob));
        assert_eq!(store.count(&bob), 0);
        // A removed message can be stored again.
        assert!(store.save(&msg, &bob));
    }

    #[test]
    fn fetch_preserves_insertion_order_and_reports_remaining() {
        let store = MessageStore::new(64);
        let bob: Id = "bob@b1".parse().unwrap();
        for n in 0..10 {
            store.save(&message(n), &bob);
        }
        let (page, remaining) = store.fetch(&bob, 0, 4);
        assert_eq!(page.len(), 4);
        assert_eq!(remaining, 6);
        assert_eq!(page[0].time, 0.0);
        assert_eq!(page[3].time, 3.0);

        let (tail, remaining) = store.fetch(&bob, -3, 10);
        assert_eq!(tail.len(), 3);
        assert_eq!(remaining, 0);
        assert_eq!(tail[0].time, 7.0);
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let store = MessageStore::new(5);
        let bob: Id = "bob@b1".parse().unwrap();
        for n in 0..8 {
            store.save(&message(n), &bob);
        }
        assert_eq!(store.count(&bob), 5);
        assert_eq!(store.dropped_count(), 3);
        let (page, _) = store.fetch(&bob, 0, 10);
        // The very first inserted message is gone.
        assert_eq!(page[0].time, 3.0);
        // A dropped signature may be stored again.
        assert!(store.save(&message(0), &bob));
    }

    #[test]
    fn receivers_are_independent() {
        let store = MessageStore::new(4);
        let bob: Id = "bob@b1".parse().unwrap();
        let carol: Id = "carol@c3".parse().unwrap();
        store.save(&message(1), &bob);
        store.save(&message(1), &carol);
        assert_eq!(store.count(&bob), 1);
        assert_eq!(store.count(&carol), 1);
        store.remove(&message(1), &bob);
        assert_eq!(store.count(&carol), 1);
    }
}
