//! The bridge: one inner link to the local station, one outer link per
//! peer, and the routing rules between them.
//!
//! Messages arriving on the inner link fan out to peers; messages
//! arriving on an outer link forward to the inner.  A message whose
//! sender equals its receiver is a loop and is dropped.  Outgoing fan-out
//! never visits a peer twice (`recipients`), never revisits a station the
//! message has passed (`traces`), and honors the `neighbor` pin.

use crate::client::{LinkConfig, LinkInbound, run_link};
use crate::config::OctopusConfig;
use dim_core::{Id, ReliableMessage};
use std::collections::HashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Routing rules (pure)
// ---------------------------------------------------------------------------

/// Where a message arriving on some link goes next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// sender == receiver, or nothing left to visit.
    Drop,
    /// Forward to the inner (local station) link.
    Incoming,
    /// Fan out to these peers.
    Outgoing(Vec<Id>),
}

/// Classify a message that arrived from `origin`.
///
/// `inner` is the local station ID.  Messages from the inner link go
/// outward; messages from any outer link go inward.
pub fn route(inner: &Id, origin: &Id, peers: &[Id], msg: &ReliableMessage) -> Route {
    if msg.sender == msg.receiver {
        return Route::Drop;
    }
    if origin == inner {
        let targets = outgoing_targets(peers, msg);
        if targets.is_empty() {
            Route::Drop
        } else {
            Route::Outgoing(targets)
        }
    } else {
        Route::Incoming
    }
}

/// Peers an outgoing message still has to visit.
pub fn outgoing_targets(peers: &[Id], msg: &ReliableMessage) -> Vec<Id> {
    // A `neighbor` pin names exactly one peer.
    if let Some(pin) = &msg.neighbor {
        return peers
            .iter()
            .filter(|p| *p == pin && !msg.has_recipient(p) && !msg.has_traced(p))
            .cloned()
            .collect();
    }
    peers
        .iter()
        .filter(|p| !msg.has_recipient(p) && !msg.has_traced(p) && **p != msg.sender)
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// Bridge runtime
// ---------------------------------------------------------------------------

pub struct Bridge {
    inner_id: Id,
    peer_ids: Vec<Id>,
    links: HashMap<Id, mpsc::Sender<ReliableMessage>>,
    tasks: Vec<JoinHandle<()>>,
    inbound: mpsc::Receiver<LinkInbound>,
}

impl Bridge {
    /// Spawn all links: the inner session plus one outer session per peer.
    pub fn start(config: &OctopusConfig, shutdown: watch::Receiver<bool>) -> Bridge {
        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        let mut links = HashMap::new();
        let mut tasks = Vec::new();

        let mut spawn = |station: &crate::config::StationLink| {
            let (out_tx, out_rx) = mpsc::channel::<ReliableMessage>(1024);
            let (running_tx, _running_rx) = watch::channel(false);
            let cfg = LinkConfig {
                identity: config.station.id.clone(),
                station: station.id.clone(),
                url: station.ws_url(),
                secret: config.secret.clone(),
                meta: config.meta.clone(),
                visa: config.visa.clone(),
                tuning: config.tuning.clone(),
            };
            tasks.push(tokio::spawn(run_link(
                cfg,
                inbound_tx.clone(),
                out_rx,
                running_tx,
                shutdown.clone(),
            )));
            links.insert(station.id.clone(), out_tx);
        };

        spawn(&config.station);
        for peer in &config.peers {
            spawn(peer);
        }

        Bridge {
            inner_id: config.station.id.clone(),
            peer_ids: config.peers.iter().map(|p| p.id.clone()).collect(),
            links,
            tasks,
            inbound: inbound_rx,
        }
    }

    /// Pump messages between links until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(inner = %self.inner_id, peers = self.peer_ids.len(), "bridge running");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
                arrived = self.inbound.recv() => {
                    match arrived {
                        None => break,
                        Some(LinkInbound { station, msg }) => {
                            self.dispatch(&station, msg).await;
                        }
                    }
                }
            }
        }
        for task in &self.tasks {
            task.abort();
        }
        info!("bridge stopped");
    }

    async fn dispatch(&self, origin: &Id, msg: ReliableMessage) {
        match route(&self.inner_id, origin, &self.peer_ids, &msg) {
            Route::Drop => {
                debug!(sender = %msg.sender, receiver = %msg.receiver, "bridge dropped message");
            }
            Route::Incoming => {
                if let Some(inner) = self.links.get(&self.inner_id) {
                    if inner.send(msg).await.is_err() {
                        warn!("inner link gone, incoming message lost");
                    }
                }
            }
            Route::Outgoing(targets) => {
                let mut msg = msg;
                // Mark every target before the first send so no hop
                // re-enumerates them.
                msg.add_recipients(targets.iter());
                for target in targets {
                    if let Some(link) = self.links.get(&target) {
                        if link.send(msg.clone()).await.is_err() {
                            warn!(peer = %target, "outer link gone, message lost");
                        }
                    }
                }
            }
        }
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

    fn message(sender: &str, receiver: &str) -> ReliableMessage {
        ReliableMessage {
            sender: sender.parse().unwrap(),
            receiver: receiver.parse().unwrap(),
            time: 1.0,
            msg_type: None,
            group: None,
            data: B64.encode(b"x"),
            signature: B64.encode(b"sig-bridge"),
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

    fn peers() -> Vec<Id> {
        vec![Id::station("gsp", "s002"), Id::station("gsp", "s003")]
    }

    #[test]
    fn sender_equals_receiver_is_a_loop() {
        let inner = Id::station("gsp", "s001");
        let msg = message("gsp@s002", "gsp@s002");
        assert_eq!(route(&inner, &inner, &peers(), &msg), Route::Drop);
    }

    #[test]
    fn outer_arrivals_go_inward() {
        let inner = Id::station("gsp", "s001");
        let origin = Id::station("gsp", "s002");
        let msg = message("alice@a1", "bob@b1");
        assert_eq!(route(&inner, &origin, &peers(), &msg), Route::Incoming);
    }

    #[test]
    fn inner_arrivals_fan_out_to_unvisited_peers() {
        let inner = Id::station("gsp", "s001");
        let mut msg = message("alice@a1", "stations@everywhere");
        msg.add_trace(&Id::station("gsp", "s003"));
        let route = route(&inner, &inner, &peers(), &msg);
        assert_eq!(route, Route::Outgoing(vec![Id::station("gsp", "s002")]));
    }

    #[test]
    fn recipients_prevent_double_visits() {
        let mut msg = message("alice@a1", "stations@everywhere");
        msg.add_recipients([&Id::station("gsp", "s002")]);
        assert_eq!(
            outgoing_targets(&peers(), &msg),
            vec![Id::station("gsp", "s003")]
        );
        msg.add_recipients([&Id::station("gsp", "s003")]);
        assert!(outgoing_targets(&peers(), &msg).is_empty());
    }

    #[test]
    fn neighbor_pin_selects_exactly_one_peer() {
        let mut msg = message("alice@a1", "bob@b1");
        msg.neighbor = Some(Id::station("gsp", "s003"));
        assert_eq!(
            outgoing_targets(&peers(), &msg),
            vec![Id::station("gsp", "s003")]
        );
        // A pin to an unknown peer sends nowhere.
        msg.neighbor = Some(Id::station("gsp", "s999"));
        assert!(outgoing_targets(&peers(), &msg).is_empty());
    }
}
