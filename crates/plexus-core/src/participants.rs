//! Participant registry: which peers host which service

use parking_lot::RwLock;
use plexus_protocol::{PeerId, ServiceKey};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Peers hosting each service
#[derive(Debug, Default)]
pub struct Participants {
    sets: RwLock<HashMap<ServiceKey, BTreeSet<PeerId>>>,
}

impl Participants {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `peer` hosts `service`; returns true if it was new
    pub fn register(&self, service: &ServiceKey, peer: PeerId) -> bool {
        let added = self
            .sets
            .write()
            .entry(service.clone())
            .or_default()
            .insert(peer);
        if added {
            debug!(service = %service, peer = %peer.short(), "Participant registered");
        }
        added
    }

    /// Record that `peer` stopped hosting `service`
    pub fn unregister(&self, service: &ServiceKey, peer: PeerId) -> bool {
        let mut sets = self.sets.write();
        let Some(set) = sets.get_mut(service) else {
            return false;
        };
        let removed = set.remove(&peer);
        if set.is_empty() {
            sets.remove(service);
        }
        removed
    }

    /// Drop a departed peer from every set; returns the services it hosted
    pub fn remove_peer(&self, peer: PeerId) -> Vec<ServiceKey> {
        let mut sets = self.sets.write();
        let mut hosted = Vec::new();
        for (service, set) in sets.iter_mut() {
            if set.remove(&peer) {
                hosted.push(service.clone());
            }
        }
        sets.retain(|_, set| !set.is_empty());
        hosted
    }

    /// Hosts of a service, sorted
    pub fn peers(&self, service: &ServiceKey) -> Vec<PeerId> {
        self.sets
            .read()
            .get(service)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Hosts of a service other than `local`
    pub fn others(&self, service: &ServiceKey, local: PeerId) -> Vec<PeerId> {
        self.peers(service)
            .into_iter()
            .filter(|p| *p != local)
            .collect()
    }

    /// Whether `peer` hosts `service`
    pub fn contains(&self, service: &ServiceKey, peer: PeerId) -> bool {
        self.sets
            .read()
            .get(service)
            .is_some_and(|set| set.contains(&peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_sweep() {
        let registry = Participants::new();
        let tests = ServiceKey::new("Tests", 0);
        let other = ServiceKey::new("Other", 1);
        let (a, b) = (PeerId::random(), PeerId::random());

        assert!(registry.register(&tests, a));
        assert!(!registry.register(&tests, a));
        registry.register(&tests, b);
        registry.register(&other, b);
        assert_eq!(registry.peers(&tests).len(), 2);
        assert_eq!(registry.others(&tests, a), vec![b]);

        let mut hosted = registry.remove_peer(b);
        hosted.sort_by(|x, y| x.name.cmp(&y.name));
        assert_eq!(hosted, vec![other.clone(), tests.clone()]);
        assert!(registry.peers(&other).is_empty());
        assert!(registry.contains(&tests, a));
        assert!(!registry.contains(&tests, b));

        assert!(registry.unregister(&tests, a));
        assert!(!registry.unregister(&tests, a));
    }
}
