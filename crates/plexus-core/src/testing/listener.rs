//! Notification listener that keeps everything it receives

use crate::cache::NotificationListener;
use parking_lot::Mutex;
use plexus_protocol::{NotificationSet, NotificationType};

/// Records every notification set in delivery order
#[derive(Debug, Default)]
pub struct RecordingListener {
    sets: Mutex<Vec<NotificationSet>>,
}

impl RecordingListener {
    /// Number of sets received
    pub fn len(&self) -> usize {
        self.sets.lock().len()
    }

    /// Nothing received yet
    pub fn is_empty(&self) -> bool {
        self.sets.lock().is_empty()
    }

    /// Copy of everything received
    pub fn sets(&self) -> Vec<NotificationSet> {
        self.sets.lock().clone()
    }

    /// Sequence numbers in delivery order
    pub fn sequences(&self) -> Vec<u64> {
        self.sets.lock().iter().map(|s| s.sequence).collect()
    }

    /// Sets of one kind
    pub fn count(&self, kind: NotificationType) -> usize {
        self.sets.lock().iter().filter(|s| s.kind == kind).count()
    }

    /// Sets about one key
    pub fn for_key(&self, key: &str) -> Vec<NotificationSet> {
        self.sets
            .lock()
            .iter()
            .filter(|s| s.model_key == key)
            .cloned()
            .collect()
    }
}

impl NotificationListener for RecordingListener {
    fn on_notification(&self, set: &NotificationSet) {
        self.sets.lock().push(set.clone());
    }
}
