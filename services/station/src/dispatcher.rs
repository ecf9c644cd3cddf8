//! Dispatcher: destination classification and the roaming drain loop.
//!
//! `deliver` is synchronous and non-blocking: it classifies the receiver,
//! runs one strategy, and returns the receipts.  `add_roaming` enqueues a
//! redirect job; one background task drains the queue and replays the
//! user's stored messages toward their roaming station, page by page, in
//! insertion order.  Replay is at-least-once: entries leave the store
//! only when a session accepts them.

use crate::state::Station;
use dim_core::{Command, EntityType, Id, ReliableMessage};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Capacity of the roaming job queue; jobs past it are dropped (the next
/// login or report will re-trigger them).
const ROAMING_QUEUE: usize = 4096;

#[derive(Debug, Clone)]
pub struct RoamingJob {
    pub user: Id,
    pub station: Id,
}

pub struct Dispatcher {
    roaming_tx: mpsc::Sender<RoamingJob>,
}

impl Dispatcher {
    pub fn new() -> (Dispatcher, mpsc::Receiver<RoamingJob>) {
        let (roaming_tx, roaming_rx) = mpsc::channel(ROAMING_QUEUE);
        (Dispatcher { roaming_tx }, roaming_rx)
    }

    /// Classify the destination and run the matching strategy.
    ///
    /// `receiver` may differ from `msg.receiver` when a broadcast
    /// expansion resubmits concrete targets.
    pub fn deliver(&self, station: &Station, msg: ReliableMessage, receiver: &Id) -> Vec<Command> {
        if receiver.is_broadcast() {
            return crate::deliver::deliver_broadcast(station, &msg, receiver);
        }
        match station.accounts.entity_type(receiver) {
            EntityType::Group => crate::deliver::deliver_group(station, &msg, receiver),
            EntityType::Station | EntityType::Isp => {
                crate::deliver::deliver_station(station, &msg, receiver)
            }
            EntityType::Bot => crate::deliver::deliver_bot(station, &msg, receiver),
            EntityType::User => crate::deliver::deliver_user(station, &msg, receiver),
        }
    }

    /// Enqueue a roaming redirect job for the background drain.
    pub fn add_roaming(&self, user: Id, station: Id) {
        let job = RoamingJob { user, station };
        if let Err(e) = self.roaming_tx.try_send(job) {
            warn!(error = %e, "roaming queue full, job dropped");
        }
    }
}

// ---------------------------------------------------------------------------
// Roaming drain loop
// ---------------------------------------------------------------------------

/// Drain roaming jobs: replay each user's stored messages toward their
/// roaming station in insertion order.
pub async fn run_roaming_worker(
    station: Arc<Station>,
    mut jobs: mpsc::Receiver<RoamingJob>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
            job = jobs.recv() => {
                match job {
                    None => break,
                    Some(job) => replay_roaming(&station, &job),
                }
            }
        }
    }
    info!("roaming worker stopped");
}

fn replay_roaming(station: &Station, job: &RoamingJob) {
    let page_limit = station.config.tuning.roaming_page;
    let mut start = 0i64;
    let mut replayed = 0usize;
    loop {
        let (page, remaining) = station.store.fetch(&job.user, start, page_limit);
        if page.is_empty() {
            break;
        }
        start += page.len() as i64;
        for msg in &page {
            if crate::roamer::push_roaming(station, msg, &job.user, &job.station) {
                replayed += 1;
            }
        }
        if remaining == 0 {
            break;
        }
    }
    debug!(user = %job.user, station = %job.station, replayed, "roaming replay finished");
}
