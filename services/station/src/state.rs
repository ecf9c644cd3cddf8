//! Station context: every process-wide collaborator, built once at boot.
//!
//! No hidden globals: the listener, sessions, dispatcher and workers all
//! share one `Arc<Station>`.

use crate::accounts::AccountStore;
use crate::auth::{MessageSigner, MetaKeyVerifier, SignatureVerifier, StationSigner};
use crate::broadcast::BroadcastManager;
use crate::center::SessionCenter;
use crate::config::StationConfig;
use crate::dispatcher::{Dispatcher, RoamingJob};
use crate::processor::CommandProcessor;
use crate::pusher::PushCenter;
use crate::store::MessageStore;
use dim_core::Id;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Process counters; everything dropped silently on the hot path stays
/// observable here.
#[derive(Default)]
pub struct Metrics {
    pub cycle_dropped: AtomicU64,
    pub verify_failed: AtomicU64,
    pub blocked_dropped: AtomicU64,
    pub suspended: AtomicU64,
    pub delivered: AtomicU64,
    pub stored: AtomicU64,
    pub redirected: AtomicU64,
    pub broadcast_local: AtomicU64,
    pub unresolvable_dropped: AtomicU64,
}

impl Metrics {
    pub fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Station
// ---------------------------------------------------------------------------

pub struct Station {
    pub config: StationConfig,
    pub id: Id,
    pub accounts: Arc<AccountStore>,
    pub center: Arc<SessionCenter>,
    pub store: Arc<MessageStore>,
    pub pusher: Arc<PushCenter>,
    pub broadcast: BroadcastManager,
    pub dispatcher: Dispatcher,
    pub processor: CommandProcessor,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub signer: Arc<dyn MessageSigner>,
    pub metrics: Metrics,
}

/// Channel ends consumed by [`Station::spawn_workers`].
pub struct Workers {
    pub roaming_rx: mpsc::Receiver<RoamingJob>,
}

#[derive(Debug, thiserror::Error)]
pub enum StationError {
    #[error("account store: {0}")]
    Accounts(#[from] crate::accounts::AccountError),
}

impl Station {
    /// Build the station context.  `verifier`/`signer` default to the
    /// digest implementations backed by the account store.
    pub fn new(
        config: StationConfig,
        verifier: Option<Arc<dyn SignatureVerifier>>,
        signer: Option<Arc<dyn MessageSigner>>,
    ) -> Result<(Arc<Station>, Workers), StationError> {
        let id = config.server.id.clone();
        let accounts = Arc::new(AccountStore::open(
            &config.database,
            id.clone(),
            &config.ans,
            &config.neighbors,
        )?);
        let verifier =
            verifier.unwrap_or_else(|| Arc::new(MetaKeyVerifier::new(accounts.clone())));
        let signer = match signer {
            Some(s) => s,
            None => Arc::new(StationSigner::new(accounts.station_secret()?)),
        };
        let (dispatcher, roaming_rx) = Dispatcher::new();
        let station = Arc::new(Station {
            id,
            accounts,
            center: Arc::new(SessionCenter::new()),
            store: Arc::new(MessageStore::new(config.tuning.offline_cap)),
            pusher: Arc::new(PushCenter::new(
                config.tuning.push_queue_cap,
                config.tuning.push_queue_warn,
            )),
            broadcast: BroadcastManager::new(Duration::from_secs(
                config.tuning.neighbor_snapshot_secs,
            )),
            dispatcher,
            processor: CommandProcessor::standard(),
            verifier,
            signer,
            metrics: Metrics::default(),
            config,
        });
        Ok((station, Workers { roaming_rx }))
    }

    /// Spawn the process-wide background tasks: the roaming redirect
    /// drain and the push center drain.
    pub fn spawn_workers(
        self: &Arc<Self>,
        workers: Workers,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(crate::dispatcher::run_roaming_worker(
                self.clone(),
                workers.roaming_rx,
                shutdown.clone(),
            )),
            tokio::spawn(self.pusher.clone().run(shutdown)),
        ]
    }
}
