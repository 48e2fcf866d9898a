//! Asynchronous delivery of notification sets
//!
//! Writers enqueue onto a bounded queue; a dedicated worker thread drains it
//! into the listener.
//!
//! Writers enqueue while holding the cache's emit lock, so they never wait
//! on the listener. A listener that falls `capacity` sets behind loses the
//! sets that do not fit; they are counted and logged. Size the queue for the
//! slowest listener, or make the listener hand work off quickly.

use crate::{Error, Result};
use crossbeam_channel::{Sender, TrySendError, bounded};
use plexus_protocol::NotificationSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Receives the notification sets a cache produces
pub trait NotificationListener: Send + Sync {
    /// Called on the notifier thread, in sequence order
    fn on_notification(&self, set: &NotificationSet);
}

impl<F> NotificationListener for F
where
    F: Fn(&NotificationSet) + Send + Sync,
{
    fn on_notification(&self, set: &NotificationSet) {
        self(set)
    }
}

/// Bounded queue plus its draining worker
pub(crate) struct Notifier {
    tx: Sender<NotificationSet>,
    dropped: AtomicU64,
}

impl Notifier {
    /// Start the worker thread
    pub fn spawn(
        name: &str,
        capacity: usize,
        listener: Arc<dyn NotificationListener>,
    ) -> Result<Self> {
        let (tx, rx) = bounded::<NotificationSet>(capacity.max(1));
        std::thread::Builder::new()
            .name(format!("plexus-notify-{name}"))
            .spawn(move || {
                // exits once every sender is dropped
                for set in rx {
                    listener.on_notification(&set);
                }
            })
            .map_err(|e| Error::internal(format!("spawn notifier: {e}")))?;
        Ok(Self {
            tx,
            dropped: AtomicU64::new(0),
        })
    }

    /// Queue a set for delivery without waiting; a set that does not fit
    /// is dropped
    pub fn enqueue(&self, set: NotificationSet) {
        match self.tx.try_send(set) {
            Ok(()) => {}
            Err(TrySendError::Full(set)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    service = %set.service,
                    sequence = set.sequence,
                    dropped,
                    "Notification dropped, listener queue is full"
                );
            }
            Err(TrySendError::Disconnected(set)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    service = %set.service,
                    sequence = set.sequence,
                    "Notification dropped, listener is gone"
                );
            }
        }
    }

    /// Sets dropped so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_protocol::{NotificationType, PeerId, ServiceKey};
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn set(sequence: u64) -> NotificationSet {
        NotificationSet {
            sequence,
            service: ServiceKey::new("Tests", 0),
            model_type: "TestRecord".into(),
            source: PeerId::random(),
            model_key: format!("k{sequence}"),
            kind: NotificationType::Add,
            changes: Vec::new(),
        }
    }

    #[test]
    fn test_full_queue_does_not_block_writers() {
        let (release, gate) = mpsc::channel::<()>();
        let (seen_tx, seen) = mpsc::channel::<u64>();
        let gate = parking_lot::Mutex::new(gate);
        let listener = move |set: &NotificationSet| {
            let _ = gate.lock().recv();
            let _ = seen_tx.send(set.sequence);
        };
        let notifier = Notifier::spawn("Tests", 1, Arc::new(listener)).unwrap();

        let started = Instant::now();
        for sequence in 1..=6 {
            notifier.enqueue(set(sequence));
        }
        assert!(started.elapsed() < Duration::from_secs(1));
        // one set in the listener at most, one in the queue
        assert!(notifier.dropped() >= 4);

        for _ in 0..6 {
            let _ = release.send(());
        }
        let dropped = notifier.dropped();
        // the worker drains what was queued, then exits with the listener
        drop(notifier);
        let delivered: Vec<u64> = seen.iter().collect();
        assert_eq!(delivered[0], 1);
        assert_eq!(delivered.len() as u64 + dropped, 6);
    }
}
