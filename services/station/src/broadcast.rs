//! Broadcast recipient expansion.
//!
//! Expands `stations@everywhere` / `everyone@everywhere` / `name@anywhere`
//! receivers into concrete targets, excluding stations the message has
//! already visited (`traces`) and targets an upstream hop has already
//! enumerated (`recipients`).  The enumerated set is merged back into the
//! message before forwarding so downstream hops cannot re-enumerate.
//!
//! The neighbor set (configured neighbors plus proactively connected
//! stations) is snapshotted and reused for a configurable interval.

use crate::accounts::AccountStore;
use crate::center::SessionCenter;
use dim_core::{EntityType, Id, ReliableMessage};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

struct Snapshot {
    neighbors: Vec<Id>,
    refreshed: Instant,
}

pub struct BroadcastManager {
    snapshot: Mutex<Option<Snapshot>>,
    ttl: Duration,
}

impl BroadcastManager {
    pub fn new(snapshot_ttl: Duration) -> BroadcastManager {
        BroadcastManager {
            snapshot: Mutex::new(None),
            ttl: snapshot_ttl,
        }
    }

    /// Neighbor stations: provider-configured entries plus stations with
    /// a live session here.  Cached for the snapshot interval.
    pub fn neighbor_stations(
        &self,
        accounts: &AccountStore,
        center: &SessionCenter,
    ) -> Vec<Id> {
        let mut guard = self.snapshot.lock().unwrap();
        if let Some(snap) = guard.as_ref() {
            if snap.refreshed.elapsed() < self.ttl {
                return snap.neighbors.clone();
            }
        }
        let mut neighbors: Vec<Id> = accounts.neighbors().into_iter().map(|n| n.id).collect();
        for id in center.all_users() {
            if accounts.entity_type(&id) == EntityType::Station && !neighbors.contains(&id) {
                neighbors.push(id);
            }
        }
        debug!(count = neighbors.len(), "neighbor snapshot refreshed");
        *guard = Some(Snapshot {
            neighbors: neighbors.clone(),
            refreshed: Instant::now(),
        });
        neighbors
    }

    /// Expand a broadcast receiver into new concrete targets.
    ///
    /// Mutates the message: the newly enumerated targets are merged into
    /// `recipients`.  The sender and the local station are never targets.
    pub fn expand(
        &self,
        msg: &mut ReliableMessage,
        local: &Id,
        accounts: &AccountStore,
        center: &SessionCenter,
    ) -> Vec<Id> {
        let receiver = msg.receiver.clone();
        let mut candidates: Vec<Id> = Vec::new();

        if receiver == Id::every_station() || receiver == Id::everyone() {
            for station in self.neighbor_stations(accounts, center) {
                if !msg.has_traced(&station) && !candidates.contains(&station) {
                    candidates.push(station);
                }
            }
            if receiver == Id::everyone() {
                for bot in accounts.station_bots() {
                    if !msg.has_traced(&bot) && !candidates.contains(&bot) {
                        candidates.push(bot);
                    }
                }
            }
        } else if receiver.address == dim_core::Address::Anywhere {
            // A user broadcast like `archivist@anywhere` resolves through
            // the ANS registry to a single concrete ID.
            if let Some(resolved) = accounts.ans_resolve(&receiver.name) {
                if !msg.has_traced(&resolved) {
                    candidates.push(resolved);
                }
            }
        }

        // Never re-enumerate what an upstream hop already covered.
        let fresh: Vec<Id> = candidates
            .into_iter()
            .filter(|c| !msg.has_recipient(c))
            .collect();
        msg.add_recipients(fresh.iter());

        fresh
            .into_iter()
            .filter(|t| t != &msg.sender && t != local)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
