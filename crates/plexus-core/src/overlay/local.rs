//! In-process overlay
//!
//! Every peer joined to a [`LocalNetwork`] gets an endpoint with an inbound
//! queue drained by one task, so one-way messages are handled in arrival
//! order. Requests run on their own task. All traffic is encoded and
//! decoded with the wire codec on the way through.

use super::{InboundHandler, Overlay};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use plexus_protocol::{Message, PeerId};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

enum Delivery {
    Frame(Vec<u8>),
    Departed(PeerId),
}

struct Endpoint {
    queue: mpsc::UnboundedSender<Delivery>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
    handler: RwLock<Option<Weak<dyn InboundHandler>>>,
}

#[derive(Default)]
struct Registry {
    endpoints: RwLock<HashMap<PeerId, Arc<Endpoint>>>,
}

/// Shared medium all local peers join
#[derive(Clone, Default)]
pub struct LocalNetwork {
    registry: Arc<Registry>,
}

impl LocalNetwork {
    /// Empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a peer. Joining again with the same id replaces the old
    /// endpoint, which is then disconnected.
    pub fn join(&self, id: PeerId) -> Arc<LocalOverlay> {
        let (queue, inbox) = mpsc::unbounded_channel();
        let endpoint = Arc::new(Endpoint {
            queue,
            inbox: Mutex::new(Some(inbox)),
            handler: RwLock::new(None),
        });
        if self
            .registry
            .endpoints
            .write()
            .insert(id, endpoint.clone())
            .is_some()
        {
            warn!(peer = %id.short(), "Peer rejoined, old endpoint replaced");
        }
        debug!(peer = %id.short(), "Peer joined local network");
        Arc::new(LocalOverlay {
            id,
            registry: self.registry.clone(),
            endpoint,
        })
    }

    /// Disconnect a peer and tell everyone else it left
    pub fn disconnect(&self, id: PeerId) -> bool {
        if self.registry.endpoints.write().remove(&id).is_none() {
            return false;
        }
        let remaining: Vec<Arc<Endpoint>> =
            self.registry.endpoints.read().values().cloned().collect();
        for endpoint in remaining {
            let _ = endpoint.queue.send(Delivery::Departed(id));
        }
        info!(peer = %id.short(), "Peer left local network");
        true
    }

    /// Connected peers, sorted
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.registry.endpoints.read().keys().copied().collect();
        peers.sort();
        peers
    }

    /// Whether a peer is connected
    pub fn is_connected(&self, id: PeerId) -> bool {
        self.registry.endpoints.read().contains_key(&id)
    }
}

/// One peer's view of a [`LocalNetwork`]
pub struct LocalOverlay {
    id: PeerId,
    registry: Arc<Registry>,
    endpoint: Arc<Endpoint>,
}

impl LocalOverlay {
    fn ensure_connected(&self) -> Result<()> {
        match self.registry.endpoints.read().get(&self.id) {
            Some(current) if Arc::ptr_eq(current, &self.endpoint) => Ok(()),
            _ => Err(Error::peer(format!(
                "peer {} is disconnected",
                self.id.short()
            ))),
        }
    }

    fn target(&self, to: PeerId) -> Result<Arc<Endpoint>> {
        self.ensure_connected()?;
        self.registry
            .endpoints
            .read()
            .get(&to)
            .cloned()
            .ok_or_else(|| Error::peer(format!("peer {} unreachable", to.short())))
    }
}

#[async_trait]
impl Overlay for LocalOverlay {
    fn local_id(&self) -> PeerId {
        self.id
    }

    async fn unicast(&self, to: PeerId, msg: Message) -> Result<()> {
        let frame = msg.encode()?;
        self.target(to)?
            .queue
            .send(Delivery::Frame(frame))
            .map_err(|_| Error::peer(format!("peer {} stopped receiving", to.short())))
    }

    async fn multicast(&self, msg: Message) -> Result<()> {
        self.ensure_connected()?;
        let frame = msg.encode()?;
        let targets: Vec<Arc<Endpoint>> = self
            .registry
            .endpoints
            .read()
            .iter()
            .filter(|(id, _)| **id != self.id)
            .map(|(_, endpoint)| endpoint.clone())
            .collect();
        for endpoint in targets {
            let _ = endpoint.queue.send(Delivery::Frame(frame.clone()));
        }
        Ok(())
    }

    async fn forward(&self, to: PeerId, msg: Message) -> Result<Message> {
        let handler = self
            .target(to)?
            .handler
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::peer(format!("peer {} is not serving", to.short())))?;

        let inbound = Message::decode(&msg.encode()?)?;
        let reply = tokio::spawn(async move { handler.on_request(inbound).await })
            .await
            .map_err(|e| Error::internal(format!("request task failed: {e}")))??;
        Ok(Message::decode(&reply.encode()?)?)
    }

    async fn request(&self, to: PeerId, msg: Message, timeout: Duration) -> Result<Message> {
        let action = msg.action;
        tokio::time::timeout(timeout, self.forward(to, msg))
            .await
            .map_err(|_| {
                Error::timed_out(format!(
                    "{action} to {} after {}ms",
                    to.short(),
                    timeout.as_millis()
                ))
            })?
    }

    fn bind(&self, handler: Weak<dyn InboundHandler>) {
        *self.endpoint.handler.write() = Some(handler.clone());
        let Some(mut inbox) = self.endpoint.inbox.lock().take() else {
            warn!(peer = %self.id.short(), "Overlay already bound");
            return;
        };
        let id = self.id;
        tokio::spawn(async move {
            while let Some(delivery) = inbox.recv().await {
                let Some(handler) = handler.upgrade() else {
                    break;
                };
                match delivery {
                    Delivery::Frame(frame) => match Message::decode(&frame) {
                        Ok(msg) => handler.on_message(msg).await,
                        Err(e) => warn!(peer = %id.short(), "Dropping bad frame: {}", e),
                    },
                    Delivery::Departed(peer) => handler.on_peer_departed(peer).await,
                }
            }
            debug!(peer = %id.short(), "Inbound loop stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_protocol::{Action, Elements, ServiceKey};
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Message>>,
        departed: Mutex<Vec<PeerId>>,
        slow: bool,
    }

    #[async_trait]
    impl InboundHandler for Recorder {
        async fn on_message(&self, msg: Message) {
            self.seen.lock().push(msg);
        }

        async fn on_request(&self, msg: Message) -> Result<Message> {
            if self.slow {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            let mut reply = msg.reply(msg.source);
            reply.elements = msg.elements.clone();
            Ok(reply)
        }

        async fn on_peer_departed(&self, peer: PeerId) {
            self.departed.lock().push(peer);
        }
    }

    fn bound(network: &LocalNetwork, slow: bool) -> (Arc<LocalOverlay>, Arc<Recorder>) {
        let overlay = network.join(PeerId::random());
        let recorder = Arc::new(Recorder {
            slow,
            ..Recorder::default()
        });
        let as_handler: Arc<dyn InboundHandler> = recorder.clone();
        overlay.bind(Arc::downgrade(&as_handler));
        // keep the handler alive for the whole test
        std::mem::forget(as_handler);
        (overlay, recorder)
    }

    fn msg(from: PeerId, action: Action) -> Message {
        Message::new(from, ServiceKey::new("Tests", 0), action)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_unicast_keeps_order() {
        let network = LocalNetwork::new();
        let (a, _) = bound(&network, false);
        let (b, rb) = bound(&network, false);

        for i in 0..20 {
            let m = msg(a.local_id(), Action::Notify).with_elements(Elements::one(json!(i)));
            a.unicast(b.local_id(), m).await.unwrap();
        }
        settle().await;
        let seen: Vec<_> = rb.seen.lock().iter().map(|m| m.elements.items[0].clone()).collect();
        assert_eq!(seen, (0..20).map(|i| json!(i)).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_multicast_skips_sender() {
        let network = LocalNetwork::new();
        let (a, ra) = bound(&network, false);
        let (_b, rb) = bound(&network, false);
        let (_c, rc) = bound(&network, false);

        a.multicast(msg(a.local_id(), Action::LeaderHeartbeat)).await.unwrap();
        settle().await;
        assert!(ra.seen.lock().is_empty());
        assert_eq!(rb.seen.lock().len(), 1);
        assert_eq!(rc.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_forward_round_trip() {
        let network = LocalNetwork::new();
        let (a, _) = bound(&network, false);
        let (b, _) = bound(&network, false);

        let request = msg(a.local_id(), Action::Get).with_elements(Elements::one(json!({"k": 1})));
        let reply = a.forward(b.local_id(), request).await.unwrap();
        assert_eq!(reply.source, a.local_id());
        assert_eq!(reply.elements.items[0]["k"], 1);
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let network = LocalNetwork::new();
        let (a, _) = bound(&network, false);
        let (b, _) = bound(&network, true);

        let result = a
            .request(b.local_id(), msg(a.local_id(), Action::Get), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(Error::TimedOut(_))));
    }

    #[tokio::test]
    async fn test_disconnect_reports_departure() {
        let network = LocalNetwork::new();
        let (a, ra) = bound(&network, false);
        let (b, _) = bound(&network, false);

        assert!(network.disconnect(b.local_id()));
        assert!(!network.disconnect(b.local_id()));
        settle().await;
        assert_eq!(*ra.departed.lock(), vec![b.local_id()]);

        // both directions are closed
        assert!(matches!(
            a.unicast(b.local_id(), msg(a.local_id(), Action::Notify)).await,
            Err(Error::PeerFailure(_))
        ));
        assert!(matches!(
            b.multicast(msg(b.local_id(), Action::Notify)).await,
            Err(Error::PeerFailure(_))
        ));
        assert_eq!(network.peers(), vec![a.local_id()]);
    }
}
