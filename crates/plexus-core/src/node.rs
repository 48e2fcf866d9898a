//! A peer: hosts services and ties the subsystems to the overlay
//!
//! ```text
//!                    ┌──────────────── Node ────────────────┐
//!  caller ──write──► │ coordinator ─► leader worker          │
//!                    │      │              │                 │
//!                    │      ▼              ▼                 │
//!  overlay ◄───────► │ participant   election   registry     │
//!                    │      │                                │
//!                    │      ▼                                │
//!                    │ ServiceHandler (cache)  Rep-<service> │
//!                    └───────────────────────────────────────┘
//! ```
//!
//! Inbound one-way traffic (registry, election, `Notify`) arrives in
//! sender order on the overlay's inbound loop. Requests (transaction steps,
//! reads, `Sync`, `EndPoints`) run on their own tasks.

use crate::cache::{page_bounds, sort_rows};
use crate::config::PlexusConfig;
use crate::election::{Election, send_all, spawn_monitor};
use crate::overlay::{InboundHandler, Overlay};
use crate::participants::Participants;
use crate::replication::{self, ReplicationIndex, ReplicationService, is_shadow, shadow_key};
use crate::service::{RequestContext, ServiceHandler, TransactionConfig, dispatch};
use crate::transaction::{ServiceTransactions, coordinator, participant};
use crate::{Error, Result, sync};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use plexus_protocol::{
    Action, Elements, Message, PeerId, Query, ServiceKey, TOTAL_STAT, TransactionId,
    TransactionState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One hosted service and the machinery around it
pub(crate) struct ServiceRuntime {
    pub(crate) key: ServiceKey,
    pub(crate) handler: Arc<dyn ServiceHandler>,
    pub(crate) tx_config: Option<TransactionConfig>,
    pub(crate) transactions: Option<Arc<ServiceTransactions>>,
    pub(crate) election: Option<Arc<Election>>,
    pub(crate) cancel: CancellationToken,
}

/// State shared by the node handle, its tasks and the overlay
pub(crate) struct NodeCore {
    pub(crate) id: PeerId,
    pub(crate) config: PlexusConfig,
    pub(crate) overlay: Arc<dyn Overlay>,
    pub(crate) participants: Participants,
    pub(crate) services: DashMap<ServiceKey, Arc<ServiceRuntime>>,
    pub(crate) replication: DashMap<ServiceKey, Arc<ReplicationService>>,
    pub(crate) cancel: CancellationToken,
    activation: tokio::sync::Mutex<()>,
}

/// A peer hosting services
pub struct Node {
    core: Arc<NodeCore>,
}

impl Node {
    /// Start a node on `overlay`. The node answers inbound traffic as soon
    /// as this returns.
    pub fn start(overlay: Arc<dyn Overlay>, config: PlexusConfig) -> Result<Self> {
        config.validate()?;
        let id = overlay.local_id();
        let core = Arc::new(NodeCore {
            id,
            config,
            overlay: overlay.clone(),
            participants: Participants::new(),
            services: DashMap::new(),
            replication: DashMap::new(),
            cancel: CancellationToken::new(),
            activation: tokio::sync::Mutex::new(()),
        });
        let inbound: Arc<dyn InboundHandler> = core.clone();
        overlay.bind(Arc::downgrade(&inbound));
        info!(peer = %id.short(), "Node started");
        Ok(Self { core })
    }

    /// Local peer id
    pub fn id(&self) -> PeerId {
        self.core.id
    }

    /// Configuration in effect
    pub fn config(&self) -> &PlexusConfig {
        &self.core.config
    }

    /// Host `service` with `handler`.
    ///
    /// Registers the local peer as participant, joins the election and, if
    /// enabled, catches up from the leader in the background.
    pub async fn activate(&self, service: ServiceKey, handler: Arc<dyn ServiceHandler>) -> Result<()> {
        let core = &self.core;
        let _guard = core.activation.lock().await;

        if is_shadow(&service) {
            return Err(Error::validation(format!(
                "{service} uses the reserved {} prefix",
                replication::REPLICATION_PREFIX
            )));
        }
        ServiceKey::validated(service.name.clone(), service.area)
            .map_err(|e| Error::validation(e.to_string()))?;
        if core.services.contains_key(&service) {
            return Err(Error::validation(format!("{service} is already active")));
        }

        handler.activate(&service, core.id).await?;
        let tx_config = handler.transaction_config();
        let cancel = core.cancel.child_token();
        let now = Instant::now();
        let election = Arc::new(Election::new(
            service.clone(),
            core.id,
            core.config.election.clone(),
            now,
        ));

        let (transactions, queue) = match tx_config {
            Some(_) => {
                let (transactions, queue) = ServiceTransactions::new(service.clone());
                (Some(transactions), Some(queue))
            }
            None => (None, None),
        };

        let rt = Arc::new(ServiceRuntime {
            key: service.clone(),
            handler,
            tx_config,
            transactions,
            election: Some(election.clone()),
            cancel: cancel.clone(),
        });

        if tx_config.is_some_and(|c| c.replication) {
            let listener = replication::broadcaster(core.overlay.clone(), cancel.clone());
            let index = Arc::new(ReplicationService::new(
                service.clone(),
                core.id,
                Some(listener),
                core.config.cache.notification_queue,
            )?);
            let shadow_handler: Arc<dyn ServiceHandler> = index.handler();
            let shadow = Arc::new(ServiceRuntime {
                key: shadow_key(&service),
                handler: shadow_handler,
                tx_config: None,
                transactions: None,
                election: None,
                cancel: cancel.clone(),
            });
            core.services.insert(shadow.key.clone(), shadow);
            core.replication.insert(service.clone(), index);
        }

        if let Some(queue) = queue {
            coordinator::spawn_worker(core.clone(), rt.clone(), queue);
        }
        core.services.insert(service.clone(), rt.clone());
        core.participants.register(&service, core.id);

        let query = Message::new(core.id, service.clone(), Action::ServiceQuery);
        if let Err(e) = core.overlay.multicast(query).await {
            warn!(service = %service, "Service query not sent: {}", e);
        }
        send_all(core.overlay.as_ref(), election.join(now)).await;
        spawn_monitor(election, core.overlay.clone(), cancel);

        if core.config.sync.enabled {
            let (core, rt) = (core.clone(), rt.clone());
            tokio::spawn(async move {
                let service = rt.key.clone();
                if let Err(e) = sync::recover(core, rt).await {
                    warn!(service = %service, "Sync failed: {}", e);
                }
            });
        }

        info!(service = %service, peer = %core.id.short(), "Service activated");
        Ok(())
    }

    /// Stop hosting a service: resign leadership, leave the registry and
    /// call the handler's teardown
    pub async fn deactivate(&self, service: &ServiceKey) -> Result<()> {
        let core = &self.core;
        let _guard = core.activation.lock().await;

        let (_, rt) = core
            .services
            .remove(service)
            .ok_or_else(|| Error::not_found(format!("{service} is not active")))?;
        rt.cancel.cancel();
        if let Some(election) = &rt.election {
            send_all(core.overlay.as_ref(), election.resign(Instant::now())).await;
        }

        let leave = Message::new(core.id, service.clone(), Action::ServiceUnregister);
        if let Err(e) = core.overlay.multicast(leave).await {
            debug!(service = %service, "Unregister not sent: {}", e);
        }
        core.participants.unregister(service, core.id);
        core.services.remove(&shadow_key(service));
        core.replication.remove(service);

        rt.handler.deactivate().await?;
        info!(service = %service, peer = %core.id.short(), "Service deactivated");
        Ok(())
    }

    /// Whether `service` is hosted here
    pub fn is_active(&self, service: &ServiceKey) -> bool {
        self.core.services.contains_key(service)
    }

    /// Insert or replace
    pub async fn post(&self, service: &ServiceKey, elements: Elements) -> Result<Elements> {
        self.write(service, Action::Post, elements).await
    }

    /// Replace
    pub async fn put(&self, service: &ServiceKey, elements: Elements) -> Result<Elements> {
        self.write(service, Action::Put, elements).await
    }

    /// Update the set fields
    pub async fn patch(&self, service: &ServiceKey, elements: Elements) -> Result<Elements> {
        self.write(service, Action::Patch, elements).await
    }

    /// Remove
    pub async fn delete(&self, service: &ServiceKey, elements: Elements) -> Result<Elements> {
        self.write(service, Action::Delete, elements).await
    }

    /// Apply a write: through a transaction when the service has a
    /// transaction config, otherwise straight to the local handler
    pub async fn write(&self, service: &ServiceKey, action: Action, elements: Elements) -> Result<Elements> {
        if !action.is_write() {
            return Err(Error::validation(format!("{action} is not a write")));
        }
        if elements.is_empty() {
            return Err(Error::validation("no records"));
        }
        let rt = self.core.runtime(service)?;
        match rt.tx_config {
            Some(_) => coordinator::execute(&self.core, &rt, action, elements).await,
            None => {
                rt.handler.key_of(&elements)?;
                let ctx = RequestContext::local(self.core.id);
                dispatch(rt.handler.as_ref(), action, elements, &ctx).await
            }
        }
    }

    /// Read by key (records in `elements`) or by query
    pub async fn get(&self, service: &ServiceKey, elements: Elements) -> Result<Elements> {
        let rt = self.core.runtime(service)?;
        self.core.read(&rt, elements).await
    }

    /// Current leader of a service
    pub fn leader(&self, service: &ServiceKey) -> Option<PeerId> {
        self.core.election(service).and_then(|e| e.leader())
    }

    /// Whether the local peer leads a service
    pub fn is_leader(&self, service: &ServiceKey) -> bool {
        self.core.election(service).is_some_and(|e| e.is_leader())
    }

    /// Wait until a leader of `service` is known
    pub async fn wait_for_leader(&self, service: &ServiceKey, timeout: Duration) -> Option<PeerId> {
        let election = self.core.election(service)?;
        election.wait_for_leader(timeout).await
    }

    /// Peers known to host a service
    pub fn participants(&self, service: &ServiceKey) -> Vec<PeerId> {
        self.core.participants.peers(service)
    }

    /// Local copy of a partitioned service's replication index
    pub fn local_index(&self, service: &ServiceKey) -> Option<ReplicationIndex> {
        self.core
            .replication
            .get(service)
            .map(|entry| entry.value().index())
    }

    /// Replication index as the leader sees it
    pub async fn end_points(&self, service: &ServiceKey) -> Result<ReplicationIndex> {
        let core = &self.core;
        let election = core
            .election(service)
            .ok_or_else(|| Error::not_found(format!("{service} is not active")))?;
        let leader = election
            .wait_for_leader(core.config.leader_wait())
            .await
            .ok_or_else(|| Error::timed_out(format!("no leader for {service}")))?;
        if leader == core.id {
            return self
                .local_index(service)
                .ok_or_else(|| Error::not_found(format!("{service} is not partitioned")));
        }
        let msg = Message::new(core.id, service.clone(), Action::EndPoints);
        let reply = core
            .overlay
            .request(leader, msg, core.config.fanout_timeout())
            .await?;
        let elements = into_result(reply)?;
        let first = elements
            .first()
            .cloned()
            .ok_or_else(|| Error::not_found(format!("{service} has no index")))?;
        Ok(serde_json::from_value(first)?)
    }

    /// Transaction holding the service lock on this peer
    pub fn locked_transaction(&self, service: &ServiceKey) -> Option<TransactionId> {
        self.core
            .runtime(service)
            .ok()
            .and_then(|rt| rt.transactions.as_ref().and_then(|t| t.locked_by()))
    }

    /// Catch up from the leader now; returns the number of records replayed
    pub async fn request_sync(&self, service: &ServiceKey) -> Result<usize> {
        let rt = self.core.runtime(service)?;
        sync::recover(self.core.clone(), rt).await
    }

    /// Deactivate every service and stop all tasks
    pub async fn shutdown(&self) {
        let services: Vec<ServiceKey> = self
            .core
            .services
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| !is_shadow(key))
            .collect();
        for service in services {
            if let Err(e) = self.deactivate(&service).await {
                warn!(service = %service, "Deactivation failed: {}", e);
            }
        }
        self.core.cancel.cancel();
        info!(peer = %self.core.id.short(), "Node stopped");
    }

    /// Stop all tasks without telling the other peers, as a crash would
    pub fn halt(&self) {
        self.core.cancel.cancel();
        warn!(peer = %self.core.id.short(), "Node halted");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.core.cancel.cancel();
    }
}

impl NodeCore {
    pub(crate) fn runtime(&self, service: &ServiceKey) -> Result<Arc<ServiceRuntime>> {
        self.services
            .get(service)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::not_found(format!("{service} is not hosted on {}", self.id.short())))
    }

    fn election(&self, service: &ServiceKey) -> Option<Arc<Election>> {
        self.services
            .get(service)
            .and_then(|entry| entry.value().election.clone())
    }

    /// Serve a read, waiting for the service lock unless the service allows
    /// concurrent reads
    pub(crate) async fn read(&self, rt: &ServiceRuntime, elements: Elements) -> Result<Elements> {
        if let (Some(tx), Some(config)) = (&rt.transactions, rt.tx_config) {
            if !config.concurrent_gets {
                tx.wait_unlocked().await;
            }
        }
        let ctx = RequestContext::local(self.id);

        if rt.tx_config.is_some_and(|c| c.replication) {
            if !elements.is_empty() {
                let key = rt.handler.key_of(&elements)?;
                let hosts = self
                    .replication
                    .get(&rt.key)
                    .and_then(|index| index.value().location(&key))
                    .unwrap_or_default();
                if !hosts.contains(&self.id) {
                    if let Some(peer) = hosts.first().copied() {
                        debug!(service = %rt.key, key = %key, peer = %peer.short(), "Forwarding read");
                        let msg = Message::new(self.id, rt.key.clone(), Action::MapRGet)
                            .with_elements(elements);
                        let reply = self
                            .overlay
                            .request(peer, msg, self.config.fanout_timeout())
                            .await?;
                        return into_result(reply);
                    }
                }
            } else if rt.handler.is_map_reduce()
                && rt.election.as_ref().is_some_and(|e| e.is_leader())
            {
                return self.map_reduce(rt, elements, &ctx).await;
            }
        }

        rt.handler.get(elements, &ctx).await
    }

    /// Keyless read over every partition, merged by the handler.
    ///
    /// Partitions answer the whole result set; ordering and the requested
    /// page apply to the merged records.
    async fn map_reduce(
        &self,
        rt: &ServiceRuntime,
        elements: Elements,
        ctx: &RequestContext,
    ) -> Result<Elements> {
        let query = elements.query.clone().unwrap_or_default();
        let unpaged = Elements::query(Query {
            page: 0,
            limit: 0,
            ..query.clone()
        });

        let others = self.participants.others(&rt.key, self.id);
        let timeout = self.config.fanout_timeout();
        let requests = others.iter().map(|peer| {
            let msg = Message::new(self.id, rt.key.clone(), Action::MapRGet)
                .with_elements(unpaged.clone());
            self.overlay.request(*peer, msg, timeout)
        });
        let (local, remote) = tokio::join!(rt.handler.get(unpaged.clone(), ctx), join_all(requests));

        let mut parts = vec![local?];
        for (peer, reply) in others.iter().zip(remote) {
            match reply.and_then(into_result) {
                Ok(part) => parts.push(part),
                Err(e) => warn!(service = %rt.key, peer = %peer.short(), "Partition read failed: {}", e),
            }
        }
        let merged = rt.handler.merge(parts);
        Ok(page_merged(rt.handler.as_ref(), merged, query))
    }

    async fn on_registry(&self, msg: Message) {
        match msg.action {
            Action::ServiceRegister => {
                self.participants.register(&msg.service, msg.source);
            }
            Action::ServiceUnregister => {
                self.participants.unregister(&msg.service, msg.source);
            }
            Action::ServiceQuery => {
                self.participants.register(&msg.service, msg.source);
                if self.services.contains_key(&msg.service) {
                    let reply = Message::new(self.id, msg.service.clone(), Action::ServiceRegister);
                    if let Err(e) = self.overlay.unicast(msg.source, reply).await {
                        debug!(service = %msg.service, "Register reply not sent: {}", e);
                    }
                }
            }
            _ => {}
        }
    }

    async fn on_data_request(&self, rt: &ServiceRuntime, msg: &Message) -> Result<Elements> {
        match msg.action {
            Action::Get => self.read(rt, msg.elements.clone()).await,
            action if action.is_map_reduce() => {
                let ctx = RequestContext {
                    source: msg.source,
                    ..RequestContext::local(self.id)
                };
                dispatch(rt.handler.as_ref(), action, msg.elements.clone(), &ctx).await
            }
            action if rt.tx_config.is_some() => {
                coordinator::execute(self, rt, action, msg.elements.clone()).await
            }
            action => {
                let ctx = RequestContext {
                    source: msg.source,
                    ..RequestContext::local(self.id)
                };
                dispatch(rt.handler.as_ref(), action, msg.elements.clone(), &ctx).await
            }
        }
    }
}

#[async_trait]
impl InboundHandler for NodeCore {
    async fn on_message(&self, msg: Message) {
        if msg.action.is_registry() {
            return self.on_registry(msg).await;
        }
        let Ok(rt) = self.runtime(&msg.service) else {
            return;
        };
        match msg.action {
            action if action.is_election() => {
                if let Some(election) = &rt.election {
                    let out = election.handle(&msg, Instant::now());
                    send_all(self.overlay.as_ref(), out).await;
                }
            }
            Action::Notify => {
                let Some(set) = &msg.notification else {
                    return;
                };
                if set.source == self.id {
                    return;
                }
                if let Err(e) = rt.handler.notify(set).await {
                    warn!(service = %rt.key, sequence = set.sequence, "Notification not applied: {}", e);
                }
            }
            other => debug!(service = %rt.key, "Ignoring one-way {}", other),
        }
    }

    async fn on_request(&self, msg: Message) -> Result<Message> {
        let mut reply = msg.reply(self.id);
        let rt = match self.runtime(&msg.service) {
            Ok(rt) => rt,
            Err(e) => {
                if msg.transaction.is_some() {
                    if let Some(header) = reply.transaction.as_mut() {
                        header.fail(TransactionState::Errored, e.to_string());
                    }
                } else {
                    reply.elements = Elements::error(e.to_string());
                }
                return Ok(reply);
            }
        };

        let result = match msg.action {
            action if action.is_data() && msg.transaction.is_some() => {
                return Ok(participant::handle(self, &rt, msg).await);
            }
            action if action.is_data() => self.on_data_request(&rt, &msg).await,
            Action::Sync => rt.handler.sync().await.map(|count| {
                let mut elements = Elements::empty();
                elements.stats.insert(TOTAL_STAT.to_string(), count as i64);
                elements
            }),
            Action::EndPoints => match self.replication.get(&rt.key) {
                Some(index) => Elements::from_record(&index.value().index()).map_err(Error::from),
                None => Err(Error::not_found(format!("{} is not partitioned", rt.key))),
            },
            action if action.is_election() => {
                if let Some(election) = &rt.election {
                    let out = election.handle(&msg, Instant::now());
                    send_all(self.overlay.as_ref(), out).await;
                }
                Ok(Elements::empty())
            }
            other => Err(Error::protocol(format!("{other} is not a request"))),
        };

        match result {
            Ok(elements) => reply.elements = elements,
            Err(e) => reply.elements = Elements::error(e.to_string()),
        }
        Ok(reply)
    }

    async fn on_peer_departed(&self, peer: PeerId) {
        let hosted = self.participants.remove_peer(peer);
        if !hosted.is_empty() {
            info!(peer = %peer.short(), services = hosted.len(), "Peer departed");
        }
        for entry in self.services.iter() {
            if let Some(tx) = &entry.value().transactions {
                tx.release_departed(peer);
            }
        }
        let elections: Vec<Arc<Election>> = self
            .services
            .iter()
            .filter_map(|entry| entry.value().election.clone())
            .collect();
        let now = Instant::now();
        for election in elections {
            send_all(self.overlay.as_ref(), election.peer_departed(peer, now)).await;
        }
    }
}

/// Order merged records on the query's sort field and cut its page
fn page_merged(handler: &dyn ServiceHandler, mut merged: Elements, query: Query) -> Elements {
    let mut rows: Vec<(String, serde_json::Value)> = merged
        .items
        .drain(..)
        .map(|item| {
            let key = handler.key_of(&Elements::one(item.clone())).unwrap_or_default();
            (key, item)
        })
        .collect();
    sort_rows(&mut rows, &query);

    let total = rows.len();
    let (start, end) = page_bounds(total, &query);
    merged.items = rows.drain(start..end).map(|(_, item)| item).collect();
    merged.stats.insert(TOTAL_STAT.to_string(), total as i64);
    merged.query = Some(query);
    merged
}

/// Payload of a reply, or the error it carries
fn into_result(reply: Message) -> Result<Elements> {
    match reply.error_text() {
        Some(text) => Err(Error::from_remote(&text)),
        None => Ok(reply.elements),
    }
}
