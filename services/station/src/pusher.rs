//! Push center: out-of-band notification fan-out.
//!
//! A bounded FIFO drained by one background task that calls every
//! registered push service.  Back-pressure policy: new notifications are
//! dropped when the queue exceeds the hard cap and a warning fires above
//! the soft cap.  Notification text is synthesized from the message type
//! hint only — the station has no plaintext.

use dim_core::{Id, ReliableMessage};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{Notify, watch};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Notification model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Notification {
    pub sender: Id,
    pub receiver: Id,
    pub title: String,
    pub content: String,
    pub image: Option<String>,
    pub badge: Option<u32>,
    pub sound: Option<String>,
}

/// A registered push provider (APNs, FCM, ... behind this seam).
pub trait PushService: Send + Sync {
    fn push(&self, notification: &Notification);
}

/// Human wording per message type hint.
fn describe(msg_type: Option<u32>) -> &'static str {
    match msg_type {
        Some(0x10) => "sent you a file",
        Some(0x12) => "sent you an image",
        Some(0x14) => "sent you a voice message",
        Some(0x16) => "sent you a video",
        Some(0x40) => "sent you some money",
        _ => "sent you a message",
    }
}

// ---------------------------------------------------------------------------
// PushCenter
// ---------------------------------------------------------------------------

pub struct PushCenter {
    queue: Mutex<VecDeque<Notification>>,
    notify: Notify,
    services: RwLock<Vec<Arc<dyn PushService>>>,
    cap: usize,
    warn_at: usize,
    dropped: AtomicU64,
}

impl PushCenter {
    pub fn new(cap: usize, warn_at: usize) -> PushCenter {
        PushCenter {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            services: RwLock::new(Vec::new()),
            cap,
            warn_at,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn register(&self, service: Arc<dyn PushService>) {
        self.services.write().unwrap().push(service);
    }

    /// Enqueue a notification; drops it when the queue is past the cap.
    pub fn add_notification(&self, notification: Notification) {
        let mut queue = self.queue.lock().unwrap();
        let len = queue.len();
        if len >= self.cap {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(len, dropped_total = total, "push queue full, notification dropped");
            return;
        }
        if len >= self.warn_at {
            warn!(len, "push queue past soft cap");
        }
        queue.push_back(notification);
        drop(queue);
        self.notify.notify_one();
    }

    /// Synthesize and enqueue a notification for an undeliverable message.
    pub fn notify_message(&self, msg: &ReliableMessage) {
        let sender = msg.sender.clone();
        let notification = Notification {
            title: "New message".to_owned(),
            content: format!("{} {}", sender.name, describe(msg.msg_type)),
            sender,
            receiver: msg.receiver.clone(),
            image: None,
            badge: Some(1),
            sound: None,
        };
        self.add_notification(notification);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn pop(&self) -> Option<Notification> {
        self.queue.lock().unwrap().pop_front()
    }

    /// Background drain loop: one task per process.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            while let Some(notification) = self.pop() {
                let services: Vec<Arc<dyn PushService>> =
                    self.services.read().unwrap().clone();
                debug!(
                    receiver = %notification.receiver,
                    services = services.len(),
                    "dispatching notification"
                );
                for service in services {
                    service.push(&notification);
                }
            }
            tokio::select! {
                biased;
                _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
                () = self.notify.notified() => {}
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
    use std::sync::atomic::AtomicUsize;

    struct Recorder {
        count: AtomicUsize,
        last: Mutex<Option<Notification>>,
    }

    impl PushService for Recorder {
        fn push(&self, notification: &Notification) {
            self.count.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(notification.clone());
        }
    }

    fn notification(n: u32) -> Notification {
        Notification {
            sender: "alice@a1".parse().unwrap(),
            receiver: "bob@b1".parse().unwrap(),
            title: format!("n{n}"),
            content: String::new(),
            image: None,
            badge: None,
            sound: None,
        }
    }

    #[test]
    fn queue_drops_past_cap() {
        let center = PushCenter::new(3, 2);
        for n in 0..5 {
            center.add_notification(notification(n));
        }
        assert_eq!(center.queue_len(), 3);
        assert_eq!(center.dropped_count(), 2);
    }

    #[tokio::test]
    async fn worker_drains_to_registered_services() {
        let center = Arc::new(PushCenter::new(100, 50));
        let recorder = Arc::new(Recorder {
            count: AtomicUsize::new(0),
            last: Mutex::new(None),
        });
        center.register(recorder.clone());

        let (sd_tx, sd_rx) = watch::channel(false);
        let worker = tokio::spawn(center.clone().run(sd_rx));

        for n in 0..4 {
            center.add_notification(notification(n));
        }
        for _ in 0..100 {
            if recorder.count.load(Ordering::SeqCst) == 4 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(recorder.count.load(Ordering::SeqCst), 4);
        assert_eq!(center.queue_len(), 0);

        sd_tx.send(true).unwrap();
        worker.await.unwrap();
    }

    #[test]
    fn message_notification_describes_type_without_plaintext() {
        let center = PushCenter::new(10, 5);
        let msg = ReliableMessage {
            sender: "alice@a1".parse().unwrap(),
            receiver: "bob@b1".parse().unwrap(),
            time: 1.0,
            msg_type: Some(0x12),
            group: None,
            data: String::new(),
            signature: String::new(),
            key: None,
            keys: None,
            traces: Vec::new(),
            recipients: Vec::new(),
            target: None,
            neighbor: None,
            meta: None,
            visa: None,
        };
        center.notify_message(&msg);
        let queued = center.pop().unwrap();
        assert_eq!(queued.content, "alice sent you an image");
    }
}
