//! Structured change notifications

use crate::{PeerId, ServiceKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of change a notification describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationType {
    /// New record; carries the whole record
    Add,
    /// Record replaced; carries old and new snapshots
    Replace,
    /// Record patched; carries per-field changes
    Update,
    /// Record removed; carries the old snapshot
    Delete,
    /// Snapshot replay for late joiners; carries the whole record
    Sync,
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One changed property. Values are JSON-encoded; `None` means absent.
///
/// Whole-record notifications use an empty `property_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationChange {
    /// Dotted property path, empty for the whole record
    pub property_id: String,
    /// Encoded value before the change
    pub old_value: Option<String>,
    /// Encoded value after the change
    pub new_value: Option<String>,
}

impl NotificationChange {
    /// Whole-record change
    pub fn record(old_value: Option<String>, new_value: Option<String>) -> Self {
        Self {
            property_id: String::new(),
            old_value,
            new_value,
        }
    }

    /// Change covers the whole record
    pub fn is_whole_record(&self) -> bool {
        self.property_id.is_empty()
    }
}

/// A change to one record of one service, as produced by one source peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationSet {
    /// Per-source, per-cache sequence number (strictly increasing)
    pub sequence: u64,
    /// Service that changed
    pub service: ServiceKey,
    /// Model type name of the record
    pub model_type: String,
    /// Peer whose cache produced the change
    pub source: PeerId,
    /// Primary key of the record
    pub model_key: String,
    /// Kind of change
    pub kind: NotificationType,
    /// Changes; a single whole-record entry for Add/Replace/Delete/Sync
    pub changes: Vec<NotificationChange>,
}

impl NotificationSet {
    /// Encoded whole record carried by Add/Replace/Sync (new) or Delete (old)
    pub fn snapshot(&self) -> Option<&str> {
        let change = self.changes.iter().find(|c| c.is_whole_record())?;
        match self.kind {
            NotificationType::Delete => change.old_value.as_deref(),
            _ => change.new_value.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(kind: NotificationType, change: NotificationChange) -> NotificationSet {
        NotificationSet {
            sequence: 1,
            service: ServiceKey::new("Tests", 0),
            model_type: "TestRecord".into(),
            source: PeerId::random(),
            model_key: "a".into(),
            kind,
            changes: vec![change],
        }
    }

    #[test]
    fn test_snapshot_side() {
        let add = set(
            NotificationType::Add,
            NotificationChange::record(None, Some("{\"a\":1}".into())),
        );
        assert_eq!(add.snapshot(), Some("{\"a\":1}"));

        let del = set(
            NotificationType::Delete,
            NotificationChange::record(Some("{\"a\":1}".into()), None),
        );
        assert_eq!(del.snapshot(), Some("{\"a\":1}"));

        let upd = set(
            NotificationType::Update,
            NotificationChange {
                property_id: "a".into(),
                old_value: Some("1".into()),
                new_value: Some("2".into()),
            },
        );
        assert_eq!(upd.snapshot(), None);
    }
}
