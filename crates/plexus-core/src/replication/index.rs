//! Replication index record and key placement

use crate::record::{KEY_SEPARATOR, PrimaryKey, Record};
use plexus_protocol::{PeerId, ServiceKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Where one key lives: peer -> last seen (ms since epoch)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReplicationKey {
    /// Hosting peers
    #[serde(default)]
    pub location: BTreeMap<PeerId, i64>,
}

/// A peer eligible to host keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EndPoint {
    /// Number of keys the peer hosts
    pub score: i64,
}

/// Key placement of one partitioned service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReplicationIndex {
    /// Protected service name
    pub service_name: String,
    /// Protected service area
    pub service_area: u8,
    /// Placement per primary key
    #[serde(default)]
    pub keys: BTreeMap<String, ReplicationKey>,
    /// Eligible peers and their load
    #[serde(default)]
    pub end_points: BTreeMap<PeerId, EndPoint>,
}

impl Record for ReplicationIndex {
    fn model_type() -> &'static str {
        "ReplicationIndex"
    }

    fn primary_key() -> PrimaryKey {
        PrimaryKey::new(["ServiceName", "ServiceArea"])
    }
}

/// Outcome of placing a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// Peers that host the key
    pub peers: Vec<PeerId>,
    /// The key was placed now rather than found
    pub fresh: bool,
    /// Fewer endpoints than the replication count were available
    pub shortfall: bool,
}

impl ReplicationIndex {
    /// Empty index for a protected service
    pub fn new(service: &ServiceKey) -> Self {
        Self {
            service_name: service.name.clone(),
            service_area: service.area,
            keys: BTreeMap::new(),
            end_points: BTreeMap::new(),
        }
    }

    /// Cache key of the index for `service`
    pub fn key_for(service: &ServiceKey) -> String {
        format!("{}{KEY_SEPARATOR}{}", service.name, service.area)
    }

    /// Protected service
    pub fn service(&self) -> ServiceKey {
        ServiceKey::new(self.service_name.clone(), self.service_area)
    }

    /// Add missing endpoints with a score matching what they host;
    /// returns true if anything was added
    pub fn ensure_end_points(&mut self, peers: &[PeerId]) -> bool {
        let mut added = false;
        for peer in peers {
            if !self.end_points.contains_key(peer) {
                let hosted = self.hosted_by(*peer);
                self.end_points.insert(*peer, EndPoint { score: hosted });
                added = true;
            }
        }
        added
    }

    /// Place `key` on the `count` least loaded of `candidates`, or refresh
    /// its placement if it already has one.
    ///
    /// Ties on score go to the lower peer id.
    pub fn place(
        &mut self,
        key: &str,
        count: usize,
        candidates: &[PeerId],
        now_ms: i64,
    ) -> Placement {
        if let Some(existing) = self.keys.get_mut(key) {
            for seen in existing.location.values_mut() {
                *seen = now_ms;
            }
            let peers: Vec<PeerId> = existing.location.keys().copied().collect();
            return Placement {
                shortfall: peers.len() < count,
                peers,
                fresh: false,
            };
        }

        self.ensure_end_points(candidates);
        let mut ranked: Vec<(i64, PeerId)> = candidates
            .iter()
            .filter_map(|p| self.end_points.get(p).map(|e| (e.score, *p)))
            .collect();
        ranked.sort();
        ranked.dedup_by_key(|(_, p)| *p);

        let shortfall = ranked.len() < count;
        if shortfall {
            warn!(
                service = %self.service(),
                available = ranked.len(),
                wanted = count,
                "Fewer endpoints than the replication count"
            );
        }

        let chosen: Vec<PeerId> = ranked.into_iter().take(count).map(|(_, p)| p).collect();
        let mut location = BTreeMap::new();
        for peer in &chosen {
            location.insert(*peer, now_ms);
            if let Some(end_point) = self.end_points.get_mut(peer) {
                end_point.score += 1;
            }
        }
        self.keys.insert(key.to_string(), ReplicationKey { location });

        Placement {
            peers: chosen,
            fresh: true,
            shortfall,
        }
    }

    /// Forget a key and give its hosts their capacity back
    pub fn release(&mut self, key: &str) -> Option<Vec<PeerId>> {
        let removed = self.keys.remove(key)?;
        for peer in removed.location.keys() {
            if let Some(end_point) = self.end_points.get_mut(peer) {
                end_point.score -= 1;
            }
        }
        Some(removed.location.into_keys().collect())
    }

    /// Hosts of a key
    pub fn location(&self, key: &str) -> Option<Vec<PeerId>> {
        self.keys
            .get(key)
            .map(|k| k.location.keys().copied().collect())
    }

    /// Score of an endpoint
    pub fn score(&self, peer: PeerId) -> Option<i64> {
        self.end_points.get(&peer).map(|e| e.score)
    }

    fn hosted_by(&self, peer: PeerId) -> i64 {
        self.keys
            .values()
            .filter(|k| k.location.contains_key(&peer))
            .count() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn peer(n: u8) -> PeerId {
        PeerId::from_uuid(Uuid::from_bytes([n; 16]))
    }

    fn peers(n: u8) -> Vec<PeerId> {
        (1..=n).map(peer).collect()
    }

    fn index() -> ReplicationIndex {
        ReplicationIndex::new(&ServiceKey::new("Tests", 0))
    }

    #[test]
    fn test_place_picks_lowest_scores() {
        let mut idx = index();
        let all = peers(4);

        let first = idx.place("x", 2, &all, 1);
        assert!(first.fresh);
        assert_eq!(first.peers, vec![peer(1), peer(2)]);

        let second = idx.place("y", 2, &all, 2);
        assert_eq!(second.peers, vec![peer(3), peer(4)]);

        assert_eq!(idx.score(peer(1)), Some(1));
        assert_eq!(idx.score(peer(4)), Some(1));
    }

    #[test]
    fn test_existing_key_is_refreshed() {
        let mut idx = index();
        let all = peers(3);
        idx.place("x", 2, &all, 1);
        let again = idx.place("x", 2, &all, 50);
        assert!(!again.fresh);
        assert_eq!(idx.keys["x"].location.values().copied().collect::<Vec<_>>(), vec![50, 50]);
        assert_eq!(idx.score(peer(1)), Some(1));
    }

    #[test]
    fn test_shortfall_places_on_everyone() {
        let mut idx = index();
        let placement = idx.place("x", 3, &peers(2), 1);
        assert!(placement.shortfall);
        assert_eq!(placement.peers.len(), 2);
    }

    #[test]
    fn test_release_restores_scores() {
        let mut idx = index();
        let all = peers(3);
        idx.place("x", 2, &all, 1);
        assert_eq!(idx.release("x"), Some(vec![peer(1), peer(2)]));
        assert_eq!(idx.release("x"), None);
        assert!(idx.end_points.values().all(|e| e.score == 0));
    }

    #[test]
    fn test_late_endpoint_scores_what_it_hosts() {
        let mut idx = index();
        idx.place("x", 1, &[peer(1)], 1);
        idx.end_points.clear();
        idx.ensure_end_points(&[peer(1), peer(2)]);
        assert_eq!(idx.score(peer(1)), Some(1));
        assert_eq!(idx.score(peer(2)), Some(0));
    }

    #[test]
    fn test_index_key_matches_record_key() {
        let idx = index();
        let value = serde_json::to_value(&idx).unwrap();
        let key = ReplicationIndex::primary_key().key_of(&value).unwrap();
        assert_eq!(key, ReplicationIndex::key_for(&ServiceKey::new("Tests", 0)));
    }

    proptest! {
        #[test]
        fn replication_count_holds(endpoints in 1u8..8, count in 1usize..5, keys in 1usize..60) {
            let mut idx = index();
            let all = peers(endpoints);
            for k in 0..keys {
                idx.place(&format!("k{k}"), count, &all, 0);
            }
            let expected = count.min(all.len());
            for key in idx.keys.values() {
                prop_assert_eq!(key.location.len(), expected);
            }
        }

        #[test]
        fn placement_stays_balanced(endpoints in 2u8..8, count in 1usize..4, keys in 1usize..80) {
            prop_assume!(endpoints as usize >= count);
            let mut idx = index();
            let all = peers(endpoints);
            for k in 0..keys {
                idx.place(&format!("k{k}"), count, &all, 0);
            }
            let scores: Vec<i64> = idx.end_points.values().map(|e| e.score).collect();
            let spread = scores.iter().max().unwrap() - scores.iter().min().unwrap();
            prop_assert!(spread <= count as i64);

            // every score equals the number of hosted keys
            for (peer, end_point) in &idx.end_points {
                prop_assert_eq!(end_point.score, idx.hosted_by(*peer));
            }
        }

        #[test]
        fn release_keeps_scores_exact(keys in 1usize..40, drop_every in 1usize..5) {
            let mut idx = index();
            let all = peers(5);
            for k in 0..keys {
                idx.place(&format!("k{k}"), 2, &all, 0);
            }
            for k in (0..keys).step_by(drop_every) {
                idx.release(&format!("k{k}"));
            }
            for (peer, end_point) in &idx.end_points {
                prop_assert_eq!(end_point.score, idx.hosted_by(*peer));
            }
        }
    }
}
