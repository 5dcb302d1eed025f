//! Subscriber registry and broadcast fan-out.
//!
//! Each subscriber is a bounded channel drained by its connection task.
//! A send fails once that task has dropped its receiver or has fallen a
//! full queue behind. Both are treated as terminal: the subscriber is removed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use common::MonitorMessage;
use log::{debug, info, warn};
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};

pub type SubscriberId = u64;

const DEFAULT_QUEUE: usize = 64;

/// Receiving side handed to whoever serves the subscriber's connection.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    pub messages: Receiver<Arc<MonitorMessage>>,
}

type Subscribers = BTreeMap<SubscriberId, Sender<Arc<MonitorMessage>>>;

#[derive(Debug)]
pub struct SubscriberHub {
    next_id: AtomicU64,
    queue: usize,
    subscribers: Mutex<Subscribers>,
}

impl Default for SubscriberHub {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_QUEUE)
    }
}

impl SubscriberHub {
    pub fn with_capacity(queue: usize) -> Self {
        SubscriberHub {
            next_id: AtomicU64::new(0),
            queue: queue.max(1),
            subscribers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Registers a new subscriber with an optional first message.
    pub fn connect(&self, initial: Option<MonitorMessage>) -> Subscription {
        self.connect_with(move || initial)
    }

    /// Registers a new subscriber. `initial` runs while the registry is
    /// locked, so no broadcast can land between building the first message
    /// and the subscriber becoming visible; the message is always delivered
    /// first.
    pub fn connect_with<F>(&self, initial: F) -> Subscription
    where
        F: FnOnce() -> Option<MonitorMessage>,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(self.queue);

        let mut subscribers = self.lock();
        if let Some(message) = initial() {
            // Fresh channel with room for at least one message.
            let _ = tx.try_send(Arc::new(message));
        }
        subscribers.insert(id, tx);
        info!("Subscriber {} connected. Total subscribers: {}", id, subscribers.len());

        Subscription { id, messages: rx }
    }

    /// Removes a subscriber. Unknown ids are ignored.
    pub fn disconnect(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.lock();
        let removed = subscribers.remove(&id).is_some();
        if removed {
            info!("Subscriber {} disconnected. Remaining subscribers: {}", id, subscribers.len());
        }
        removed
    }

    /// Delivers `message` to every registered subscriber and returns how
    /// many accepted it. Subscribers that are closed or stalled are dropped.
    pub fn broadcast(&self, message: MonitorMessage) -> usize {
        debug!("Broadcasting message: {}", message.kind());
        let message = Arc::new(message);

        let targets: Vec<_> = self
            .lock()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut failed = Vec::new();
        for (id, tx) in &targets {
            if let Err(e) = tx.try_send(Arc::clone(&message)) {
                failed.push((*id, e));
            }
        }

        if !failed.is_empty() {
            let mut subscribers = self.lock();
            for (id, e) in &failed {
                subscribers.remove(id);
                drop_warning(*id, e);
            }
        }

        targets.len() - failed.len()
    }

    /// Delivers `message` to one subscriber only.
    pub fn send_to(&self, id: SubscriberId, message: MonitorMessage) -> bool {
        let mut subscribers = self.lock();
        let Some(tx) = subscribers.get(&id) else {
            return false;
        };
        if let Err(e) = tx.try_send(Arc::new(message)) {
            subscribers.remove(&id);
            drop_warning(id, &e);
            return false;
        }
        true
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn drop_warning<T>(id: SubscriberId, e: &TrySendError<T>) {
    match e {
        TrySendError::Full(_) => warn!("Dropping subscriber {}: not keeping up", id),
        TrySendError::Closed(_) => warn!("Dropping subscriber {}: connection closed", id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Snapshot;

    fn drain(sub: &mut Subscription) -> Vec<Arc<MonitorMessage>> {
        let mut out = Vec::new();
        while let Ok(msg) = sub.messages.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn broadcast_reaches_every_subscriber() {
        let hub = SubscriberHub::default();
        let mut a = hub.connect(None);
        let mut b = hub.connect(None);

        assert_eq!(hub.broadcast(MonitorMessage::service_scan_complete("s3", vec![])), 2);
        assert_eq!(drain(&mut a).len(), 1);
        assert_eq!(drain(&mut b).len(), 1);
    }

    #[test]
    fn closed_subscriber_is_dropped_without_affecting_others() {
        let hub = SubscriberHub::default();
        let mut a = hub.connect(None);
        let b = hub.connect(None);
        let mut c = hub.connect(None);
        drop(b);

        let delivered = hub.broadcast(MonitorMessage::service_scan_complete("ec2", vec![]));
        assert_eq!(delivered, 2);
        assert_eq!(hub.len(), 2);
        assert_eq!(drain(&mut a).len(), 1);
        assert_eq!(drain(&mut c).len(), 1);
    }

    #[test]
    fn initial_state_precedes_later_broadcasts() {
        let hub = SubscriberHub::default();
        let snapshot = Snapshot::from_iter([("s3", vec![common::ResourceRecord::new("b1", vec![])])]);
        let mut sub = hub.connect(Some(MonitorMessage::initial_state(snapshot)));
        hub.broadcast(MonitorMessage::service_scan_complete("s3", vec![]));

        let kinds: Vec<_> = drain(&mut sub).iter().map(|m| m.kind()).collect();
        assert_eq!(kinds, vec!["initial_state", "service_scan_complete"]);
    }

    #[test]
    fn disconnect_twice_is_harmless() {
        let hub = SubscriberHub::default();
        let a = hub.connect(None);
        let mut b = hub.connect(None);

        assert!(hub.disconnect(a.id));
        assert!(!hub.disconnect(a.id));
        assert!(!hub.disconnect(9999));

        assert_eq!(hub.broadcast(MonitorMessage::error("boom")), 1);
        assert_eq!(drain(&mut b).len(), 1);
        assert_eq!(hub.len(), 1);
    }

    #[test]
    fn send_to_targets_one_subscriber() {
        let hub = SubscriberHub::default();
        let mut a = hub.connect(None);
        let mut b = hub.connect(None);

        assert!(hub.send_to(a.id, MonitorMessage::error("bad command")));
        assert_eq!(drain(&mut a).len(), 1);
        assert!(drain(&mut b).is_empty());

        let id = b.id;
        drop(b);
        assert!(!hub.send_to(id, MonitorMessage::error("gone")));
        assert_eq!(hub.len(), 1);
    }

    #[test]
    fn stalled_subscriber_is_dropped_when_its_queue_fills() {
        let hub = SubscriberHub::with_capacity(2);
        let mut reader = hub.connect(None);
        let _stalled = hub.connect(None);

        for _ in 0..2 {
            assert_eq!(hub.broadcast(MonitorMessage::service_scan_complete("s3", vec![])), 2);
            assert_eq!(drain(&mut reader).len(), 1);
        }

        // third message does not fit into the stalled subscriber's queue
        assert_eq!(hub.broadcast(MonitorMessage::service_scan_complete("s3", vec![])), 1);
        assert_eq!(hub.len(), 1);
        assert_eq!(drain(&mut reader).len(), 1);
    }

    #[test]
    fn broadcast_during_connect_reaches_the_new_subscriber() {
        let hub = Arc::new(SubscriberHub::default());
        let mut racer = None;

        let mut sub = hub.connect_with(|| {
            let hub = Arc::clone(&hub);
            racer = Some(std::thread::spawn(move || {
                hub.broadcast(MonitorMessage::changes_detected(Default::default(), 0.5))
            }));
            // give the broadcaster time to reach the registry first
            std::thread::sleep(std::time::Duration::from_millis(50));
            Some(MonitorMessage::initial_state(Snapshot::default()))
        });

        assert_eq!(racer.unwrap().join().unwrap(), 1);
        let kinds: Vec<_> = drain(&mut sub).iter().map(|m| m.kind()).collect();
        assert_eq!(kinds, vec!["initial_state", "changes_detected"]);
    }

    #[test]
    fn ids_are_unique() {
        let hub = SubscriberHub::default();
        let a = hub.connect(None);
        hub.disconnect(a.id);
        let b = hub.connect(None);
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn concurrent_connects_and_broadcasts() {
        let hub = Arc::new(SubscriberHub::default());
        let mut tasks = Vec::new();
        for i in 0..16 {
            let hub = Arc::clone(&hub);
            tasks.push(tokio::spawn(async move {
                let sub = hub.connect(None);
                hub.broadcast(MonitorMessage::service_scan_complete("s3", vec![]));
                if i % 2 == 0 {
                    hub.disconnect(sub.id);
                }
                sub
            }));
        }
        let mut subs = Vec::new();
        for task in tasks {
            subs.push(task.await.unwrap());
        }
        assert_eq!(hub.len(), 8);
    }
}
