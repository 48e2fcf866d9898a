//! Service handler contract and the cache-backed handler

use crate::cache::{NotificationListener, Storage};
use crate::dcache::DistributedCache;
use crate::record::Record;
use crate::{Error, Result};
use async_trait::async_trait;
use plexus_protocol::{
    Action, Elements, NotificationSet, PeerId, Query, ServiceKey, TOTAL_STAT, TransactionId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Transaction settings of a service; `None` from
/// [`ServiceHandler::transaction_config`] means writes are applied locally
/// without transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Partition keys over `replication_count` peers instead of every peer
    pub replication: bool,
    /// Replicas per key in partitioned mode
    pub replication_count: usize,
    /// Let reads run while a transaction holds the service lock
    pub concurrent_gets: bool,
}

impl TransactionConfig {
    /// Every peer holds every record
    pub fn full() -> Self {
        Self {
            replication: false,
            replication_count: 0,
            concurrent_gets: false,
        }
    }

    /// Every key lives on `count` peers
    pub fn partitioned(count: usize) -> Self {
        Self {
            replication: true,
            replication_count: count,
            concurrent_gets: false,
        }
    }

    /// Allow reads during commits
    pub fn with_concurrent_gets(mut self) -> Self {
        self.concurrent_gets = true;
        self
    }
}

/// Opaque descriptor of an external endpoint a service exposes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebService {
    /// Route prefix
    pub path: String,
    /// Actions reachable through it
    pub actions: Vec<Action>,
}

/// Why a handler is being called
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Local peer
    pub peer: PeerId,
    /// Peer the request came from
    pub source: PeerId,
    /// The call replays a change that already happened elsewhere; caches
    /// must not emit notifications for it
    pub source_is_notification: bool,
    /// The call undoes a committed action
    pub rollback: bool,
    /// Transaction driving the call
    pub transaction: Option<TransactionId>,
}

impl RequestContext {
    /// Direct call on the local peer
    pub fn local(peer: PeerId) -> Self {
        Self {
            peer,
            source: peer,
            source_is_notification: false,
            rollback: false,
            transaction: None,
        }
    }

    /// Replay of a remote change
    pub fn notification(peer: PeerId, source: PeerId) -> Self {
        Self {
            source,
            source_is_notification: true,
            ..Self::local(peer)
        }
    }

    /// Commit step of a transaction
    pub fn commit(peer: PeerId, source: PeerId, id: TransactionId) -> Self {
        Self {
            source,
            transaction: Some(id),
            ..Self::local(peer)
        }
    }

    /// Rollback step of a transaction
    pub fn rollback(peer: PeerId, source: PeerId, id: TransactionId) -> Self {
        Self {
            rollback: true,
            ..Self::commit(peer, source, id)
        }
    }
}

/// A user service hosted by a node.
///
/// Handlers are invoked directly, from a transaction commit or rollback,
/// or when replaying notifications.
#[async_trait]
pub trait ServiceHandler: Send + Sync + 'static {
    /// Called once when the service is registered on a node
    async fn activate(&self, _service: &ServiceKey, _peer: PeerId) -> Result<()> {
        Ok(())
    }

    /// Called on teardown
    async fn deactivate(&self) -> Result<()> {
        Ok(())
    }

    /// Insert or replace
    async fn post(&self, elements: Elements, ctx: &RequestContext) -> Result<Elements>;

    /// Replace
    async fn put(&self, elements: Elements, ctx: &RequestContext) -> Result<Elements>;

    /// Update the set fields
    async fn patch(&self, elements: Elements, ctx: &RequestContext) -> Result<Elements>;

    /// Remove
    async fn delete(&self, elements: Elements, ctx: &RequestContext) -> Result<Elements>;

    /// Read by key, or by query when no record is given
    async fn get(&self, elements: Elements, ctx: &RequestContext) -> Result<Elements>;

    /// A delivery of `elements` to a peer failed with `msg`
    async fn failed(
        &self,
        _elements: Elements,
        _ctx: &RequestContext,
        _msg: &str,
    ) -> Result<Elements> {
        Ok(Elements::empty())
    }

    /// Transaction settings, `None` for a local-only service
    fn transaction_config(&self) -> Option<TransactionConfig> {
        None
    }

    /// External endpoint descriptor
    fn web_service(&self) -> Option<WebService> {
        None
    }

    /// Primary key of the first record
    fn key_of(&self, elements: &Elements) -> Result<String>;

    /// Keyless reads on the leader of a partitioned service fan out as
    /// `MapR_GET` and are combined with [`ServiceHandler::merge`]
    fn is_map_reduce(&self) -> bool {
        false
    }

    /// Combine partial `MapR_GET` results. The default concatenates records,
    /// keeps the first copy of a key held by several replicas and adds up
    /// counters. `Total` is the number of distinct records.
    fn merge(&self, parts: Vec<Elements>) -> Elements {
        let mut merged = Elements::empty();
        let mut seen = HashSet::new();
        for mut part in parts {
            let items = std::mem::take(&mut part.items);
            part.stats.remove(TOTAL_STAT);
            merged.merge(part);
            for item in items {
                let item = Elements::one(item);
                // records without a key cannot be duplicates
                let fresh = match self.key_of(&item) {
                    Ok(key) => seen.insert(key),
                    Err(_) => true,
                };
                if fresh {
                    merged.items.extend(item.items);
                }
            }
        }
        merged
            .stats
            .insert(TOTAL_STAT.to_string(), merged.items.len() as i64);
        merged
    }

    /// Apply a notification set received from another peer
    async fn notify(&self, _set: &NotificationSet) -> Result<()> {
        Ok(())
    }

    /// Replay the whole content as `Sync` notifications; returns the count
    async fn sync(&self) -> Result<usize> {
        Ok(0)
    }
}

/// Dispatch a data action to the matching handler method
pub async fn dispatch(
    handler: &dyn ServiceHandler,
    action: Action,
    elements: Elements,
    ctx: &RequestContext,
) -> Result<Elements> {
    match action.base() {
        Action::Post => handler.post(elements, ctx).await,
        Action::Put => handler.put(elements, ctx).await,
        Action::Patch => handler.patch(elements, ctx).await,
        Action::Delete => handler.delete(elements, ctx).await,
        Action::Get => handler.get(elements, ctx).await,
        other => Err(Error::protocol(format!("{other} is not a data action"))),
    }
}

/// Handler serving a [`DistributedCache`] of typed records
pub struct CacheService<T: Record> {
    cache: DistributedCache<T>,
    transactions: Option<TransactionConfig>,
}

impl<T: Record> CacheService<T> {
    /// Serve `service` on `peer`, local-only until
    /// [`CacheService::with_transactions`] is called
    pub fn new(service: ServiceKey, peer: PeerId) -> Self {
        Self {
            cache: DistributedCache::new(service, peer),
            transactions: None,
        }
    }

    /// Run writes through transactions
    pub fn with_transactions(mut self, config: TransactionConfig) -> Self {
        self.transactions = Some(config);
        self
    }

    /// Deliver notifications to `listener`
    pub fn with_listener(
        mut self,
        listener: Arc<dyn NotificationListener>,
        queue_capacity: usize,
    ) -> Result<Self> {
        self.cache = self.cache.with_listener(listener, queue_capacity)?;
        Ok(self)
    }

    /// Persist writes to a storage sink
    pub fn with_storage(mut self, storage: Arc<dyn Storage>, in_memory: bool) -> Result<Self> {
        self.cache = self.cache.with_storage(storage, in_memory)?;
        Ok(self)
    }

    /// Backing cache
    pub fn cache(&self) -> &DistributedCache<T> {
        &self.cache
    }

    fn write(
        &self,
        elements: Elements,
        ctx: &RequestContext,
        op: impl Fn(&DistributedCache<T>, serde_json::Value, bool) -> Result<()>,
    ) -> Result<Elements> {
        if elements.is_empty() {
            return Err(Error::validation("no records"));
        }
        let mut stored = Vec::with_capacity(elements.len());
        for item in elements.items {
            let key = self.cache.cache().key_of(&item)?;
            op(&self.cache, item, ctx.source_is_notification)?;
            if let Ok(record) = self.cache.get_by_key(&key) {
                stored.push(serde_json::to_value(record)?);
            }
        }
        Ok(Elements::many(stored))
    }
}

#[async_trait]
impl<T: Record> ServiceHandler for CacheService<T> {
    async fn post(&self, elements: Elements, ctx: &RequestContext) -> Result<Elements> {
        self.write(elements, ctx, |cache, item, quiet| {
            cache.post_value(item, quiet).map(|_| ())
        })
    }

    async fn put(&self, elements: Elements, ctx: &RequestContext) -> Result<Elements> {
        self.post(elements, ctx).await
    }

    async fn patch(&self, elements: Elements, ctx: &RequestContext) -> Result<Elements> {
        self.write(elements, ctx, |cache, item, quiet| {
            cache.patch_value(item, quiet).map(|_| ())
        })
    }

    async fn delete(&self, elements: Elements, ctx: &RequestContext) -> Result<Elements> {
        if elements.is_empty() {
            return Err(Error::validation("no records"));
        }
        let mut removed = Vec::with_capacity(elements.len());
        for item in &elements.items {
            let key = self.cache.cache().key_of(item)?;
            let old = self.cache.get_by_key(&key)?;
            self.cache.delete_key(&key, ctx.source_is_notification)?;
            removed.push(serde_json::to_value(old)?);
        }
        Ok(Elements::many(removed))
    }

    async fn get(&self, elements: Elements, _ctx: &RequestContext) -> Result<Elements> {
        if !elements.is_empty() {
            let mut found = Vec::with_capacity(elements.len());
            for item in &elements.items {
                let key = self.cache.cache().key_of(item)?;
                found.push(serde_json::to_value(self.cache.get_by_key(&key)?)?);
            }
            return Ok(Elements::many(found));
        }

        let query = elements.query.unwrap_or_default();
        let page = self.cache.fetch(&query)?;
        let items = page
            .items
            .iter()
            .map(serde_json::to_value)
            .collect::<serde_json::Result<Vec<_>>>()?;
        let mut out = Elements::many(items);
        out.query = Some(query);
        out.stats = page.stats;
        out.stats.insert(TOTAL_STAT.to_string(), page.total as i64);
        Ok(out)
    }

    fn transaction_config(&self) -> Option<TransactionConfig> {
        self.transactions
    }

    fn key_of(&self, elements: &Elements) -> Result<String> {
        let first = elements
            .first()
            .ok_or_else(|| Error::validation("no records"))?;
        self.cache.cache().key_of(first)
    }

    async fn notify(&self, set: &NotificationSet) -> Result<()> {
        self.cache.apply_notification(set).map(|_| ())
    }

    async fn sync(&self) -> Result<usize> {
        self.cache.sync()
    }
}

/// `Query` asking only for the total
pub(crate) fn count_query() -> Query {
    Query::page(0, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestRecord;
    use serde_json::json;

    fn service() -> (CacheService<TestRecord>, RequestContext) {
        let peer = PeerId::random();
        (
            CacheService::new(ServiceKey::new("Tests", 0), peer),
            RequestContext::local(peer),
        )
    }

    #[tokio::test]
    async fn test_crud_through_handler() {
        let (svc, ctx) = service();
        let posted = svc
            .post(Elements::one(json!({"MyString": "a", "MyInt": 1})), &ctx)
            .await
            .unwrap();
        assert_eq!(posted.items[0]["MyInt"], 1);

        svc.patch(Elements::one(json!({"MyString": "a", "MyInt": 5})), &ctx)
            .await
            .unwrap();
        let got = svc
            .get(Elements::one(json!({"MyString": "a"})), &ctx)
            .await
            .unwrap();
        assert_eq!(got.items[0]["MyInt"], 5);

        let removed = svc
            .delete(Elements::one(json!({"MyString": "a"})), &ctx)
            .await
            .unwrap();
        assert_eq!(removed.items[0]["MyInt"], 5);
        assert!(matches!(
            svc.get(Elements::one(json!({"MyString": "a"})), &ctx).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_query_reports_total() {
        let (svc, ctx) = service();
        for k in ["a", "b", "c"] {
            svc.post(Elements::one(json!({"MyString": k})), &ctx)
                .await
                .unwrap();
        }
        let page = svc.get(Elements::query(count_query()), &ctx).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page.total(), 3);
    }

    #[test]
    fn test_merge_keeps_one_copy_per_key() {
        let (svc, _ctx) = service();
        let part = |keys: &[&str]| {
            let mut part = Elements::many(keys.iter().map(|k| json!({"MyString": k})).collect());
            part.stats.insert(TOTAL_STAT.to_string(), keys.len() as i64);
            part.stats.insert("hits".to_string(), 1);
            part
        };

        let merged = svc.merge(vec![part(&["a", "b"]), part(&["b", "c"]), part(&[])]);
        let keys: Vec<_> = merged.items.iter().map(|v| v["MyString"].clone()).collect();
        assert_eq!(keys, vec![json!("a"), json!("b"), json!("c")]);
        assert_eq!(merged.total(), 3);
        assert_eq!(merged.stats["hits"], 3);
    }

    #[tokio::test]
    async fn test_validation() {
        let (svc, ctx) = service();
        assert!(matches!(
            svc.post(Elements::empty(), &ctx).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            svc.post(Elements::one(json!({"MyInt": 1})), &ctx).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(svc.key_of(&Elements::empty()), Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_dispatch_rejects_control_actions() {
        let (svc, ctx) = service();
        let result = dispatch(&svc, Action::Sync, Elements::empty(), &ctx).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
        let result = dispatch(&svc, Action::MapRGet, Elements::empty(), &ctx).await;
        assert!(result.is_ok());
    }
}
