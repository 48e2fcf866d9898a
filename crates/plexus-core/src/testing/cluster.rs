//! In-process clusters of nodes hosting a [`TestRecord`] service

use super::{FaultyHandler, RecordingListener, TestRecord, wait_until};
use crate::config::PlexusConfig;
use crate::node::Node;
use crate::overlay::LocalNetwork;
use crate::service::{CacheService, ServiceHandler, TransactionConfig};
use crate::{Error, Result};
use plexus_protocol::{PeerId, ServiceKey};
use std::sync::Arc;
use std::time::Duration;

/// How long [`Cluster::start`] waits for the cluster to settle
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// One peer of a [`Cluster`]
pub struct ClusterPeer {
    /// Peer id
    pub id: PeerId,
    /// The node
    pub node: Node,
    /// Backing cache service
    pub cache: Arc<CacheService<TestRecord>>,
    /// Notifications emitted by the cache
    pub listener: Arc<RecordingListener>,
    /// Fault injection in front of the cache
    pub faults: Arc<FaultyHandler>,
}

/// Peers on one [`LocalNetwork`], all hosting the same service.
///
/// Peers are sorted by id, so `peers[0]` is the peer the election settles on.
pub struct Cluster {
    /// Shared in-process overlay
    pub network: LocalNetwork,
    /// Hosted service
    pub service: ServiceKey,
    /// Node configuration
    pub config: PlexusConfig,
    /// Service transaction settings
    pub tx_config: TransactionConfig,
    /// Peers by ascending id
    pub peers: Vec<ClusterPeer>,
}

impl Cluster {
    /// Start `n` peers hosting `Tests/0` and wait until every peer knows
    /// every participant and agrees on the leader
    pub async fn start(n: usize, config: PlexusConfig, tx_config: TransactionConfig) -> Result<Self> {
        let mut ids: Vec<PeerId> = (0..n).map(|_| PeerId::random()).collect();
        ids.sort();

        let mut cluster = Self {
            network: LocalNetwork::new(),
            service: ServiceKey::new("Tests", 0),
            config,
            tx_config,
            peers: Vec::with_capacity(n),
        };
        for id in ids {
            let peer = cluster.spawn_peer(id).await?;
            cluster.peers.push(peer);
        }
        cluster.settle().await?;
        Ok(cluster)
    }

    /// Peer `i`
    pub fn peer(&self, i: usize) -> &ClusterPeer {
        &self.peers[i]
    }

    /// Index of the peer every live peer follows
    pub fn leader_index(&self) -> Option<usize> {
        self.peers
            .iter()
            .position(|p| self.network.is_connected(p.id) && p.node.is_leader(&self.service))
    }

    /// Wait until every connected peer sees all connected peers as
    /// participants and follows the same leader
    pub async fn settle(&self) -> Result<()> {
        let settled = wait_until(SETTLE_TIMEOUT, || {
            let live: Vec<&ClusterPeer> = self
                .peers
                .iter()
                .filter(|p| self.network.is_connected(p.id))
                .collect();
            let Some(leader) = live.first().and_then(|p| p.node.leader(&self.service)) else {
                return false;
            };
            live.iter().all(|p| {
                p.node.leader(&self.service) == Some(leader)
                    && p.node.participants(&self.service).len() == live.len()
            })
        })
        .await;
        if settled {
            Ok(())
        } else {
            Err(Error::timed_out("cluster did not settle"))
        }
    }

    /// Cut peer `i` off and stop its tasks without a goodbye
    pub fn crash(&self, i: usize) {
        let peer = &self.peers[i];
        self.network.disconnect(peer.id);
        peer.node.halt();
    }

    /// Bring peer `i` back with the same id and an empty cache
    pub async fn restart(&mut self, i: usize) -> Result<()> {
        let id = self.peers[i].id;
        let peer = self.spawn_peer(id).await?;
        self.peers[i] = peer;
        Ok(())
    }

    async fn spawn_peer(&self, id: PeerId) -> Result<ClusterPeer> {
        let overlay = self.network.join(id);
        let node = Node::start(overlay, self.config.clone())?;

        let listener = Arc::new(RecordingListener::default());
        let cache = Arc::new(
            CacheService::new(self.service.clone(), id)
                .with_transactions(self.tx_config)
                .with_listener(listener.clone(), self.config.cache.notification_queue)?,
        );
        let faults = Arc::new(FaultyHandler::new(cache.clone()));
        let handler: Arc<dyn ServiceHandler> = faults.clone();
        node.activate(self.service.clone(), handler).await?;

        Ok(ClusterPeer {
            id,
            node,
            cache,
            listener,
            faults,
        })
    }
}
