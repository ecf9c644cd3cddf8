//! Server-side session: per-connection state and outbound queue.
//!
//! A session is created when a connection is accepted and lives until the
//! gate closes.  Its key is generated at construction and never changes;
//! its identifier is bound exactly once by a successful handshake and
//! only reassigned by an authenticated login.  The outbound queue is
//! priority-sorted, FIFO within a priority, bounded, and drains through
//! the gate via the writer task.

use crate::state::Station;
use dim_core::Id;
use dim_protocol::{Arrival, Departure, Priority};
use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::sync::{Notify, mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// MsgRef
// ---------------------------------------------------------------------------

/// Reference to a stored offline message; resolves the store entry to
/// remove once a session accepts the message for sending.
#[derive(Debug, Clone)]
pub struct MsgRef {
    pub receiver: Id,
    pub signature: String,
}

// ---------------------------------------------------------------------------
// OutboundQueue
// ---------------------------------------------------------------------------

struct Queued {
    priority: i8,
    seq: u64,
    departure: Departure,
    msg_ref: Option<MsgRef>,
}

// Min-heap on (priority, seq): lower priority first, FIFO within one.
impl PartialEq for Queued {
    fn eq(&self, other: &Queued) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for Queued {}
impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Queued) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Queued {
    fn cmp(&self, other: &Queued) -> std::cmp::Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

struct QueueInner {
    heap: BinaryHeap<Queued>,
    next_seq: u64,
}

/// Bounded priority queue feeding one gate writer.
pub struct OutboundQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> OutboundQueue {
        OutboundQueue {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a departure.  On overflow the oldest queued entry is
    /// dropped (and counted); the new entry always goes in.
    pub fn push(&self, departure: Departure, msg_ref: Option<MsgRef>) {
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Queued {
            priority: departure.priority.0,
            seq,
            departure,
            msg_ref,
        });
        if inner.heap.len() > self.capacity {
            // Drop the oldest entry regardless of priority.
            let mut entries: Vec<Queued> = std::mem::take(&mut inner.heap).into_vec();
            if let Some(pos) = entries
                .iter()
                .enumerate()
                .min_by_key(|(_, q)| q.seq)
                .map(|(i, _)| i)
            {
                let evicted = entries.swap_remove(pos);
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(seq = evicted.seq, dropped_total = total, "outbound queue overflow");
            }
            inner.heap = entries.into();
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// Wait for and remove the highest-priority entry.
    pub async fn pop(&self) -> (Departure, Option<MsgRef>) {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.try_pop() {
                return item;
            }
            notified.await;
        }
    }

    /// Remove the highest-priority entry if one is queued.
    pub fn try_pop(&self) -> Option<(Departure, Option<MsgRef>)> {
        self.inner
            .lock()
            .unwrap()
            .heap
            .pop()
            .map(|q| (q.departure, q.msg_ref))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// Result of binding an identifier into a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bind {
    /// First bind (handshake).
    First,
    /// Same identifier as already bound; no-op.
    Unchanged,
    /// Rebound to a different identifier (authenticated login); carries
    /// the previous one so the center can move the session.
    Replaced(Id),
}

/// A message parked until its session finishes the handshake.
#[derive(Debug, Clone)]
pub struct Suspended {
    pub msg: dim_core::ReliableMessage,
    pub since: Instant,
}

pub struct SessionState {
    /// Session key, generated at construction, fixed for the lifetime.
    pub key: String,
    pub remote: SocketAddr,
    identifier: RwLock<Option<Id>>,
    /// (value, when); a flip only wins with a later timestamp.
    active: Mutex<(bool, f64)>,
    suspended: Mutex<Vec<Suspended>>,
}

impl SessionState {
    pub fn new(remote: SocketAddr) -> SessionState {
        SessionState {
            key: Uuid::new_v4().simple().to_string().to_uppercase(),
            remote,
            identifier: RwLock::new(None),
            active: Mutex::new((false, 0.0)),
            suspended: Mutex::new(Vec::new()),
        }
    }

    pub fn identifier(&self) -> Option<Id> {
        self.identifier.read().unwrap().clone()
    }

    /// Bind (or rebind) the session's identifier.
    pub fn bind_identifier(&self, id: &Id) -> Bind {
        let mut guard = self.identifier.write().unwrap();
        match guard.as_ref() {
            None => {
                *guard = Some(id.clone());
                Bind::First
            }
            Some(existing) if existing == id => Bind::Unchanged,
            Some(existing) => {
                let old = existing.clone();
                *guard = Some(id.clone());
                Bind::Replaced(old)
            }
        }
    }

    /// Flip the active flag.  Returns true when the flag actually changed;
    /// an update with an older timestamp loses.
    pub fn set_active(&self, value: bool, when: f64) -> bool {
        let mut guard = self.active.lock().unwrap();
        let (current, last_when) = *guard;
        if when < last_when {
            return false;
        }
        *guard = (value, when);
        current != value
    }

    pub fn is_active(&self) -> bool {
        self.active.lock().unwrap().0
    }

    /// Park a message until the handshake completes.
    pub fn suspend(&self, msg: dim_core::ReliableMessage) {
        self.suspended.lock().unwrap().push(Suspended {
            msg,
            since: Instant::now(),
        });
    }

    /// Take parked messages younger than `ttl_secs`; older ones are evicted.
    pub fn take_suspended(&self, ttl_secs: u64) -> Vec<dim_core::ReliableMessage> {
        let mut guard = self.suspended.lock().unwrap();
        let drained: Vec<Suspended> = guard.drain(..).collect();
        let mut fresh = Vec::new();
        for s in drained {
            if s.since.elapsed().as_secs() <= ttl_secs {
                fresh.push(s.msg);
            } else {
                debug!(sig = %s.msg.fingerprint(), "suspended message evicted on TTL");
            }
        }
        fresh
    }
}

// ---------------------------------------------------------------------------
// SessionHandle
// ---------------------------------------------------------------------------

/// What the rest of the station holds: shared state plus the outbound
/// queue.  Cheap to clone; the session task itself owns the channels.
#[derive(Clone)]
pub struct SessionHandle {
    pub state: Arc<SessionState>,
    pub queue: Arc<OutboundQueue>,
}

impl SessionHandle {
    pub fn new(remote: SocketAddr, queue_capacity: usize) -> SessionHandle {
        SessionHandle {
            state: Arc::new(SessionState::new(remote)),
            queue: Arc::new(OutboundQueue::new(queue_capacity)),
        }
    }

    /// Queue a message payload; `msg_ref` is resolved (removed from the
    /// offline store) once the gate accepts the frame.
    pub fn push_message(&self, payload: Vec<u8>, priority: Priority, msg_ref: Option<MsgRef>) {
        self.queue.push(Departure::message(payload, priority), msg_ref);
    }
}

// ---------------------------------------------------------------------------
// Session task
// ---------------------------------------------------------------------------

/// Run one session: read arrivals, process them, drain the outbound
/// queue into the gate.  Exits when the gate closes or shutdown fires;
/// on exit the session is marked inactive and removed from the center.
pub async fn run_session(
    station: Arc<Station>,
    handle: SessionHandle,
    mut arrivals: mpsc::Receiver<Arrival>,
    departures: mpsc::Sender<Departure>,
    mut shutdown: watch::Receiver<bool>,
) {
    let writer = tokio::spawn(run_writer(
        station.clone(),
        handle.clone(),
        departures,
        shutdown.clone(),
    ));

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
            arrival = arrivals.recv() => {
                match arrival {
                    None => break,
                    Some(arrival) => {
                        let responses =
                            crate::messenger::process_package(&station, &handle, &arrival.payload);
                        // Acknowledge the page once it has been processed.
                        if let Some(token) = arrival.ack {
                            handle.queue.push(Departure::response(token), None);
                        }
                        for payload in responses {
                            handle.push_message(payload, Priority::URGENT, None);
                        }
                    }
                }
            }
        }
    }

    // Gate is gone: the session goes inactive and loses its binding.
    let now = chrono::Utc::now().timestamp() as f64;
    handle.state.set_active(false, now);
    if let Some(id) = handle.state.identifier() {
        station.center.remove(&id, &handle.state.key);
        info!(user = %id, key = %handle.state.key, "session stopped");
    }
    writer.abort();
}

/// Drain the outbound queue into the gate.  A send the gate accepts
/// resolves the entry's `msg_ref`; a failed send marks the session
/// inactive and leaves the message stored for the next reconnect.
async fn run_writer(
    station: Arc<Station>,
    handle: SessionHandle,
    departures: mpsc::Sender<Departure>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
            item = handle.queue.pop() => {
                let (departure, msg_ref) = item;
                match departures.send(departure).await {
                    Ok(()) => {
                        if let Some(r) = msg_ref {
                            if station.store.remove_by_signature(&r.receiver, &r.signature) {
                                debug!(receiver = %r.receiver, "stored message sent and removed");
                            }
                        }
                    }
                    Err(_) => {
                        // Gate closed underneath us.
                        let now = chrono::Utc::now().timestamp() as f64;
                        handle.state.set_active(false, now);
                        warn!(key = %handle.state.key, "gate closed, send failed");
                        break;
                    }
                }
            }
        }
    }
}

/// Queue every stored message for this session's identifier, oldest
/// first, at replay priority.  Messages stay stored until the gate
/// accepts them.
pub fn reload_offline(station: &Station, handle: &SessionHandle) {
    let Some(user) = handle.state.identifier() else {
        return;
    };
    let page = station.config.tuning.roaming_page;
    let mut start = 0i64;
    loop {
        let (messages, remaining) = station.store.fetch(&user, start, page);
        if messages.is_empty() {
            break;
        }
        start += messages.len() as i64;
        for msg in messages {
            let msg_ref = MsgRef {
                receiver: user.clone(),
                signature: msg.signature.clone(),
            };
            match msg.encode() {
                Ok(payload) => handle.push_message(payload, Priority::SLOWER, Some(msg_ref)),
                Err(e) => warn!(error = %e, "stored message failed to encode"),
            }
        }
        if remaining == 0 {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
