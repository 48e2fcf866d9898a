//! Replication index service
//!
//! Every partitioned service `S` has a shadow service `Rep-S` in the same
//! area. The shadow is an ordinary cache service holding one
//! [`ReplicationIndex`] record. The leader of `S` places keys by writing
//! the shadow cache; the shadow's listener multicasts each change as a
//! `Notify` message and followers replay it into their own shadow cache.

pub mod index;

pub use index::{EndPoint, Placement, ReplicationIndex, ReplicationKey};

use crate::cache::NotificationListener;
use crate::overlay::Overlay;
use crate::service::CacheService;
use crate::{Error, Result};
use plexus_protocol::{Action, Message, NotificationSet, PeerId, ServiceKey, now_millis};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Name prefix of shadow replication services
pub const REPLICATION_PREFIX: &str = "Rep-";

/// Shadow service key of a protected service
pub fn shadow_key(service: &ServiceKey) -> ServiceKey {
    ServiceKey::new(format!("{REPLICATION_PREFIX}{}", service.name), service.area)
}

/// Whether a key names a shadow service
pub fn is_shadow(service: &ServiceKey) -> bool {
    service.name.starts_with(REPLICATION_PREFIX)
}

/// Listener that multicasts every notification as a `Notify` message
struct IndexBroadcaster {
    tx: mpsc::UnboundedSender<NotificationSet>,
}

impl NotificationListener for IndexBroadcaster {
    fn on_notification(&self, set: &NotificationSet) {
        let _ = self.tx.send(set.clone());
    }
}

/// Start the task that carries shadow notifications to the other peers.
///
/// One task keeps the sets in sequence order.
pub(crate) fn broadcaster(
    overlay: Arc<dyn Overlay>,
    cancel: CancellationToken,
) -> Arc<dyn NotificationListener> {
    let (tx, mut rx) = mpsc::unbounded_channel::<NotificationSet>();
    tokio::spawn(async move {
        loop {
            let set = tokio::select! {
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(set) => set,
                    None => break,
                },
            };
            let msg = Message::new(overlay.local_id(), set.service.clone(), Action::Notify)
                .with_notification(set);
            if let Err(e) = overlay.multicast(msg).await {
                debug!("Index notification not sent: {}", e);
            }
        }
    });
    Arc::new(IndexBroadcaster { tx })
}

/// Typed access to the shadow service of one protected service
pub struct ReplicationService {
    protected: ServiceKey,
    handler: Arc<CacheService<ReplicationIndex>>,
}

impl ReplicationService {
    /// Shadow of `protected` on `peer`. Changes go to `listener` when given.
    pub fn new(
        protected: ServiceKey,
        peer: PeerId,
        listener: Option<Arc<dyn NotificationListener>>,
        queue_capacity: usize,
    ) -> Result<Self> {
        let mut handler = CacheService::new(shadow_key(&protected), peer);
        if let Some(listener) = listener {
            handler = handler.with_listener(listener, queue_capacity)?;
        }
        Ok(Self {
            protected,
            handler: Arc::new(handler),
        })
    }

    /// Protected service
    pub fn protected(&self) -> &ServiceKey {
        &self.protected
    }

    /// Handler serving the shadow service
    pub fn handler(&self) -> Arc<CacheService<ReplicationIndex>> {
        self.handler.clone()
    }

    /// Current index, empty if nothing was placed yet
    pub fn index(&self) -> ReplicationIndex {
        self.handler
            .cache()
            .get_by_key(&ReplicationIndex::key_for(&self.protected))
            .unwrap_or_else(|_| ReplicationIndex::new(&self.protected))
    }

    /// Hosts of a key
    pub fn location(&self, key: &str) -> Option<Vec<PeerId>> {
        self.index().location(key)
    }

    /// Place a key among `candidates` and publish the new index
    pub fn place(&self, key: &str, count: usize, candidates: &[PeerId]) -> Result<Placement> {
        let mut index = self.index();
        let placement = index.place(key, count, candidates, now_millis());
        self.handler.cache().post(&index, false)?;
        Ok(placement)
    }

    /// Release a key and publish the new index
    pub fn release(&self, key: &str) -> Result<Vec<PeerId>> {
        let mut index = self.index();
        let peers = index
            .release(key)
            .ok_or_else(|| Error::not_found(format!("{} has no placement for {key:?}", self.protected)))?;
        self.handler.cache().post(&index, false)?;
        Ok(peers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingListener;
    use plexus_protocol::NotificationType;

    #[test]
    fn test_shadow_naming() {
        let tests = ServiceKey::new("Tests", 3);
        let shadow = shadow_key(&tests);
        assert_eq!(shadow.name, "Rep-Tests");
        assert_eq!(shadow.area, 3);
        assert!(is_shadow(&shadow));
        assert!(!is_shadow(&tests));
    }

    #[test]
    fn test_place_and_release_publish_changes() {
        let listener = Arc::new(RecordingListener::default());
        let service = ServiceKey::new("Tests", 0);
        let rep = ReplicationService::new(service, PeerId::random(), Some(listener.clone()), 16)
            .unwrap();
        let mut peers: Vec<PeerId> = (0..3).map(|_| PeerId::random()).collect();
        peers.sort();

        let placement = rep.place("x", 2, &peers).unwrap();
        assert_eq!(placement.peers, peers[..2].to_vec());
        assert_eq!(rep.location("x"), Some(peers[..2].to_vec()));

        rep.release("x").unwrap();
        assert_eq!(rep.location("x"), None);
        assert!(matches!(rep.release("x"), Err(Error::NotFound(_))));

        assert!(crate::testing::wait_until_sync(
            std::time::Duration::from_secs(5),
            || listener.len() == 2
        ));
        assert_eq!(listener.count(NotificationType::Add), 1);
        assert_eq!(listener.count(NotificationType::Replace), 1);
    }
}
