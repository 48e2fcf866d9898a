//! Distributed cache: a cache engine bound to a service and a peer
//!
//! Every mutation takes a `source_is_notification` flag. When set, the
//! change is applied but no notification leaves the cache, so a change that
//! arrived as a notification is never echoed back.

use crate::cache::{Cache, CacheIdentity, Change, NotificationListener, Page, Storage};
use crate::record::Record;
use crate::{Error, Result};
use plexus_protocol::{NotificationSet, NotificationType, PeerId, Query, ServiceKey};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Cache engine with service and source identity
pub struct DistributedCache<T: Record> {
    cache: Cache<T>,
}

impl<T: Record> DistributedCache<T> {
    /// New cache for `service` on peer `source`
    pub fn new(service: ServiceKey, source: PeerId) -> Self {
        Self {
            cache: Cache::new(CacheIdentity {
                service,
                source,
                model_type: T::model_type().to_string(),
            }),
        }
    }

    /// Deliver outbound notifications to `listener`
    pub fn with_listener(
        self,
        listener: Arc<dyn NotificationListener>,
        queue_capacity: usize,
    ) -> Result<Self> {
        Ok(Self {
            cache: self.cache.with_listener(listener, queue_capacity)?,
        })
    }

    /// Persist writes to a storage sink
    pub fn with_storage(self, storage: Arc<dyn Storage>, in_memory: bool) -> Result<Self> {
        Ok(Self {
            cache: self.cache.with_storage(storage, in_memory)?,
        })
    }

    /// Underlying engine
    pub fn cache(&self) -> &Cache<T> {
        &self.cache
    }

    /// Service the cache belongs to
    pub fn service(&self) -> &ServiceKey {
        &self.cache.identity().service
    }

    /// Peer the cache lives on
    pub fn source(&self) -> PeerId {
        self.cache.identity().source
    }

    /// Insert or replace
    pub fn post(&self, record: &T, source_is_notification: bool) -> Result<Option<NotificationSet>> {
        self.cache.post(record, !source_is_notification)
    }

    /// Same as [`DistributedCache::post`]
    pub fn put(&self, record: &T, source_is_notification: bool) -> Result<Option<NotificationSet>> {
        self.cache.put(record, !source_is_notification)
    }

    /// Update the set fields
    pub fn patch(&self, record: &T, source_is_notification: bool) -> Result<Option<NotificationSet>> {
        self.cache.patch(record, !source_is_notification)
    }

    /// Remove
    pub fn delete(&self, record: &T, source_is_notification: bool) -> Result<Option<NotificationSet>> {
        self.cache.delete(record, !source_is_notification)
    }

    /// Insert or replace a record in serde form
    pub fn post_value(
        &self,
        value: Value,
        source_is_notification: bool,
    ) -> Result<Option<NotificationSet>> {
        self.cache.post_value(value, !source_is_notification)
    }

    /// Patch a record in serde form
    pub fn patch_value(
        &self,
        value: Value,
        source_is_notification: bool,
    ) -> Result<Option<NotificationSet>> {
        self.cache.patch_value(value, !source_is_notification)
    }

    /// Remove by key
    pub fn delete_key(
        &self,
        key: &str,
        source_is_notification: bool,
    ) -> Result<Option<NotificationSet>> {
        self.cache.delete_key(key, !source_is_notification)
    }

    /// Clone of the stored record
    pub fn get(&self, record: &T) -> Result<T> {
        self.cache.get(record)
    }

    /// Clone of the stored record for a key
    pub fn get_by_key(&self, key: &str) -> Result<T> {
        self.cache.get_by_key(key)
    }

    /// Paged query
    pub fn fetch(&self, query: &Query) -> Result<Page<T>> {
        self.cache.fetch(query)
    }

    /// Clones of the matching records
    pub fn collect(&self, predicate: impl Fn(&T) -> bool) -> Result<BTreeMap<String, T>> {
        self.cache.collect(predicate)
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// No records
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Replay every record to the listener as `Sync` notifications
    pub fn sync(&self) -> Result<usize> {
        self.cache.sync()
    }

    /// Apply a notification produced by another peer's cache.
    ///
    /// The change is applied with notifications suppressed. Sets produced
    /// by this peer are ignored. Deleting an absent key is not an error.
    pub fn apply_notification(&self, set: &NotificationSet) -> Result<Option<NotificationSet>> {
        if set.source == self.source() {
            return Ok(None);
        }
        match set.kind {
            NotificationType::Add | NotificationType::Replace | NotificationType::Sync => {
                let snapshot = set.snapshot().ok_or_else(|| {
                    Error::validation(format!("{} notification without a record", set.kind))
                })?;
                self.cache.post_value(serde_json::from_str(snapshot)?, false)
            }
            NotificationType::Update => {
                let mut current = serde_json::to_value(self.cache.get_by_key(&set.model_key)?)?;
                for change in &set.changes {
                    Change::from_notification(change)?.apply(&mut current);
                }
                self.cache.post_value(current, false)
            }
            NotificationType::Delete => match self.cache.delete_key(&set.model_key, false) {
                Err(Error::NotFound(_)) => Ok(None),
                other => other,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MyEnum, RecordingListener, TestRecord, wait_until_sync};
    use std::time::Duration;

    fn pair() -> (DistributedCache<TestRecord>, DistributedCache<TestRecord>) {
        let service = ServiceKey::new("Tests", 0);
        (
            DistributedCache::new(service.clone(), PeerId::random()),
            DistributedCache::new(service, PeerId::random()),
        )
    }

    #[test]
    fn test_notification_flag_suppresses_listener() {
        let listener = Arc::new(RecordingListener::default());
        let cache = DistributedCache::<TestRecord>::new(ServiceKey::new("Tests", 0), PeerId::random())
            .with_listener(listener.clone(), 8)
            .unwrap();

        // the set is still returned to the writer
        let set = cache.post(&TestRecord::new("a", 1), true).unwrap();
        assert!(set.is_some());
        cache.post(&TestRecord::new("b", 1), false).unwrap();

        assert!(wait_until_sync(Duration::from_secs(5), || listener.len() == 1));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(listener.len(), 1);
        assert_eq!(listener.sets()[0].model_key, "b");
    }

    #[test]
    fn test_apply_notification_mirrors_writes() {
        let (origin, mirror) = pair();

        let add = origin.post(&TestRecord::new("a", 1), false).unwrap().unwrap();
        mirror.apply_notification(&add).unwrap();
        assert_eq!(mirror.get_by_key("a").unwrap().my_int, Some(1));

        let mut partial = TestRecord::key("a");
        partial.my_enum = Some(MyEnum::Three);
        let update = origin.patch(&partial, false).unwrap().unwrap();
        mirror.apply_notification(&update).unwrap();
        let mirrored = mirror.get_by_key("a").unwrap();
        assert_eq!(mirrored.my_enum, Some(MyEnum::Three));
        assert_eq!(mirrored.my_int, Some(1));

        let replace = origin.put(&TestRecord::new("a", 7), false).unwrap().unwrap();
        mirror.apply_notification(&replace).unwrap();
        assert_eq!(mirror.get_by_key("a").unwrap().my_int, Some(7));

        let delete = origin.delete_key("a", false).unwrap().unwrap();
        mirror.apply_notification(&delete).unwrap();
        assert!(mirror.is_empty());
        // replaying a delete is harmless
        assert!(mirror.apply_notification(&delete).unwrap().is_none());
    }

    #[test]
    fn test_own_notifications_are_ignored() {
        let (origin, _) = pair();
        let add = origin.post(&TestRecord::new("a", 1), false).unwrap().unwrap();
        origin.delete_key("a", false).unwrap();
        assert!(origin.apply_notification(&add).unwrap().is_none());
        assert!(origin.is_empty());
    }

    #[test]
    fn test_sync_seeds_a_mirror() {
        let listener = Arc::new(RecordingListener::default());
        let origin = DistributedCache::<TestRecord>::new(ServiceKey::new("Tests", 0), PeerId::random())
            .with_listener(listener.clone(), 8)
            .unwrap();
        for (k, n) in [("a", 1), ("b", 2), ("c", 3)] {
            origin.post(&TestRecord::new(k, n), true).unwrap();
        }
        assert_eq!(origin.sync().unwrap(), 3);
        assert!(wait_until_sync(Duration::from_secs(5), || listener.len() == 3));

        let (_, mirror) = pair();
        for set in listener.sets() {
            mirror.apply_notification(&set).unwrap();
        }
        assert_eq!(mirror.len(), 3);
        assert_eq!(mirror.get_by_key("c").unwrap().my_int, Some(3));
    }
}
