//! Cache engine
//!
//! A keyed in-memory store of records with:
//!
//! - **Change detection**: writes to an existing key are diffed field by
//!   field ([`Updater`]); a write that changes nothing is a no-op.
//! - **Isolation**: every record is cloned on the way in and on the way out.
//! - **Metadata**: named secondary indexes and statistic counters.
//! - **Queries**: paged, filtered, sorted reads through cached plans that
//!   are invalidated by the cache stamp.
//! - **Notifications**: every change yields a [`NotificationSet`], returned
//!   to the writer and queued for the listener.
//!
//! ```text
//!   post/put/patch/delete
//!          │
//!   ┌──────▼──────┐   stamp++    ┌─────────────┐
//!   │   entries   │ ───────────► │ query plans │
//!   │ + order     │              └─────────────┘
//!   │ + metadata  │
//!   └──────┬──────┘
//!          │ NotificationSet (seq++)
//!   ┌──────▼──────┐   bounded    ┌─────────────┐
//!   │  notifier   │ ───────────► │  listener   │
//!   └─────────────┘              └─────────────┘
//! ```

pub mod metadata;
pub mod notifier;
pub mod storage;
pub mod updater;

pub use metadata::{MetadataFn, StatFn};
pub use notifier::NotificationListener;
pub use storage::{JsonFileStorage, MemoryStorage, Storage};
pub use updater::{Change, ChangeKind, Updater};

use crate::record::{PrimaryKey, Record};
use crate::{Error, Result};
use metadata::Metadata;
use notifier::Notifier;
use parking_lot::{Mutex, RwLock};
use plexus_protocol::query::{compare_values, field_value};
use plexus_protocol::{
    NotificationChange, NotificationSet, NotificationType, PeerId, Query, ServiceKey, TOTAL_STAT,
};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use xxhash_rust::xxh3::xxh3_64;

/// Who produced a cache's notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheIdentity {
    /// Service the cache belongs to
    pub service: ServiceKey,
    /// Local peer
    pub source: PeerId,
    /// Model type of the records
    pub model_type: String,
}

/// One page of a query
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    /// Records of the page, cloned
    pub items: Vec<T>,
    /// Matches before paging
    pub total: usize,
    /// `Total` plus the statistic counters
    pub stats: BTreeMap<String, i64>,
}

/// Query plan: matching keys in result order, valid for one stamp
#[derive(Debug, Clone)]
struct Plan {
    stamp: u64,
    keys: Arc<Vec<String>>,
}

struct Inner<T> {
    entries: HashMap<String, T>,
    order: Vec<String>,
    metadata: Metadata<T>,
    stamp: u64,
}

/// What a write did, before it is turned into a notification
struct Outcome {
    kind: NotificationType,
    key: String,
    changes: Vec<NotificationChange>,
    persist: Persist,
}

enum Persist {
    Put(Value),
    Delete,
}

/// Keyed record store
pub struct Cache<T: Record> {
    identity: CacheIdentity,
    primary_key: PrimaryKey,
    inner: RwLock<Inner<T>>,
    plans: Mutex<HashMap<u64, Plan>>,
    plan_builds: AtomicU64,
    sequence: AtomicU64,
    // held from the end of a mutation until its notification is queued, so
    // sequence numbers reach the listener in order
    emit: Mutex<()>,
    storage: Option<Arc<dyn Storage>>,
    in_memory: bool,
    notifier: Option<Notifier>,
}

impl<T: Record> Cache<T> {
    /// New in-memory cache
    pub fn new(identity: CacheIdentity) -> Self {
        Self {
            identity,
            primary_key: T::primary_key(),
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                order: Vec::new(),
                metadata: Metadata::default(),
                stamp: 0,
            }),
            plans: Mutex::new(HashMap::new()),
            plan_builds: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
            emit: Mutex::new(()),
            storage: None,
            in_memory: true,
            notifier: None,
        }
    }

    /// Persist every write to a storage sink.
    ///
    /// With `in_memory = false` records live only in the sink and reads go
    /// to it.
    pub fn with_storage(mut self, storage: Arc<dyn Storage>, in_memory: bool) -> Result<Self> {
        if in_memory {
            // warm the cache from what the sink already holds
            let existing = storage.collect(&|_| true)?;
            let inner = self.inner.get_mut();
            for (key, value) in existing {
                let record: T = serde_json::from_value(value)?;
                inner.metadata.on_insert(&key, &record);
                inner.order.push(key.clone());
                inner.entries.insert(key, record);
            }
        }
        self.storage = Some(storage);
        self.in_memory = in_memory;
        Ok(self)
    }

    /// Deliver notifications to a listener through a bounded queue
    pub fn with_listener(
        mut self,
        listener: Arc<dyn NotificationListener>,
        queue_capacity: usize,
    ) -> Result<Self> {
        self.notifier = Some(Notifier::spawn(
            &self.identity.service.name,
            queue_capacity,
            listener,
        )?);
        Ok(self)
    }

    /// Identity used in notifications
    pub fn identity(&self) -> &CacheIdentity {
        &self.identity
    }

    /// Primary key of a record in serde form
    pub fn key_of(&self, value: &Value) -> Result<String> {
        self.primary_key.key_of(value)
    }

    /// Insert, or replace the changed fields of an existing record.
    ///
    /// Returns `None` when the record was already identical.
    pub fn post(&self, record: &T, notify: bool) -> Result<Option<NotificationSet>> {
        self.post_value(serde_json::to_value(record)?, notify)
    }

    /// Identical to [`Cache::post`]
    pub fn put(&self, record: &T, notify: bool) -> Result<Option<NotificationSet>> {
        self.post(record, notify)
    }

    /// Update only the fields that are set; inserts when the key is absent
    pub fn patch(&self, record: &T, notify: bool) -> Result<Option<NotificationSet>> {
        self.patch_value(serde_json::to_value(record)?, notify)
    }

    /// [`Cache::post`] for a record in serde form
    pub fn post_value(&self, value: Value, notify: bool) -> Result<Option<NotificationSet>> {
        let key = self.key_of(&value)?;
        // validate the shape before touching the store
        let record: T = serde_json::from_value(value.clone())?;

        let mut inner = self.inner.write();
        let existing = self.load(&inner, &key)?;

        let outcome = match existing {
            None => {
                let encoded = value.to_string();
                if self.in_memory {
                    inner.metadata.on_insert(&key, &record);
                    inner.order.push(key.clone());
                    inner.entries.insert(key.clone(), record);
                }
                Outcome {
                    kind: NotificationType::Add,
                    key,
                    changes: vec![NotificationChange::record(None, Some(encoded))],
                    persist: Persist::Put(value),
                }
            }
            Some(old) => {
                let old_value = serde_json::to_value(&old)?;
                let changes = Updater::replace().diff(&old_value, &value);
                if changes.is_empty() {
                    return Ok(None);
                }
                let mut merged = old_value.clone();
                updater::apply_all(&changes, &mut merged);
                let updated: T = serde_json::from_value(merged.clone())?;
                if self.in_memory {
                    inner.metadata.on_remove(&key, &old);
                    inner.metadata.on_insert(&key, &updated);
                    inner.entries.insert(key.clone(), updated);
                }
                Outcome {
                    kind: NotificationType::Replace,
                    key,
                    changes: vec![NotificationChange::record(
                        Some(old_value.to_string()),
                        Some(merged.to_string()),
                    )],
                    persist: Persist::Put(merged),
                }
            }
        };
        inner.stamp += 1;

        let emit = self.emit.lock();
        drop(inner);
        let set = self.finish(outcome, notify)?;
        drop(emit);
        Ok(Some(set))
    }

    /// [`Cache::patch`] for a (possibly partial) record in serde form
    pub fn patch_value(&self, value: Value, notify: bool) -> Result<Option<NotificationSet>> {
        let key = self.key_of(&value)?;

        let mut inner = self.inner.write();
        let Some(old) = self.load(&inner, &key)? else {
            drop(inner);
            return self.post_value(value, notify);
        };

        let old_value = serde_json::to_value(&old)?;
        let changes = Updater::patch().diff(&old_value, &value);
        if changes.is_empty() {
            return Ok(None);
        }
        let mut merged = old_value;
        updater::apply_all(&changes, &mut merged);
        let updated: T = serde_json::from_value(merged.clone())?;
        if self.in_memory {
            inner.metadata.on_remove(&key, &old);
            inner.metadata.on_insert(&key, &updated);
            inner.entries.insert(key.clone(), updated);
        }
        inner.stamp += 1;

        let outcome = Outcome {
            kind: NotificationType::Update,
            key,
            changes: changes.iter().map(Change::to_notification).collect(),
            persist: Persist::Put(merged),
        };
        let emit = self.emit.lock();
        drop(inner);
        let set = self.finish(outcome, notify)?;
        drop(emit);
        Ok(Some(set))
    }

    /// Remove a record
    pub fn delete(&self, record: &T, notify: bool) -> Result<Option<NotificationSet>> {
        let key = self.primary_key.key_of_record(record)?;
        self.delete_key(&key, notify)
    }

    /// Remove a record by key; fails with `NotFound` when absent
    pub fn delete_key(&self, key: &str, notify: bool) -> Result<Option<NotificationSet>> {
        let mut inner = self.inner.write();
        let Some(old) = self.load(&inner, key)? else {
            return Err(Error::not_found(format!(
                "{} key {key:?}",
                self.identity.service
            )));
        };
        if self.in_memory {
            inner.entries.remove(key);
            if let Some(pos) = inner.order.iter().position(|k| k == key) {
                inner.order.remove(pos);
            }
            inner.metadata.on_remove(key, &old);
        }
        inner.stamp += 1;

        let outcome = Outcome {
            kind: NotificationType::Delete,
            key: key.to_string(),
            changes: vec![NotificationChange::record(
                Some(serde_json::to_value(&old)?.to_string()),
                None,
            )],
            persist: Persist::Delete,
        };
        let emit = self.emit.lock();
        drop(inner);
        let set = self.finish(outcome, notify)?;
        drop(emit);
        Ok(Some(set))
    }

    /// Clone of the stored record with the same key as `record`
    pub fn get(&self, record: &T) -> Result<T> {
        let key = self.primary_key.key_of_record(record)?;
        self.get_by_key(&key)
    }

    /// Clone of the stored record for a key
    pub fn get_by_key(&self, key: &str) -> Result<T> {
        let inner = self.inner.read();
        self.load(&inner, key)?
            .ok_or_else(|| Error::not_found(format!("{} key {key:?}", self.identity.service)))
    }

    /// Clones of every record matching a predicate
    pub fn collect(&self, predicate: impl Fn(&T) -> bool) -> Result<BTreeMap<String, T>> {
        if !self.in_memory {
            let storage = self.storage()?;
            let mut out = BTreeMap::new();
            for (key, value) in storage.collect(&|_| true)? {
                let record: T = serde_json::from_value(value)?;
                if predicate(&record) {
                    out.insert(key, record);
                }
            }
            return Ok(out);
        }
        let inner = self.inner.read();
        Ok(inner
            .entries
            .iter()
            .filter(|(_, v)| predicate(v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    /// Paged query.
    ///
    /// Plans (filter + sort) are cached per query and rebuilt when the cache
    /// stamp moved since they were built.
    pub fn fetch(&self, query: &Query) -> Result<Page<T>> {
        if !self.in_memory {
            return self.fetch_from_storage(query);
        }
        let inner = self.inner.read();

        let planned;
        let keys: &[String] = if query.needs_plan() {
            planned = self.plan(&inner, query)?;
            planned.as_slice()
        } else {
            inner.order.as_slice()
        };

        let total = keys.len();
        let (start, end) = page_bounds(total, query);
        let items = keys[start..end]
            .iter()
            .filter_map(|k| inner.entries.get(k).cloned())
            .collect();

        let mut stats = inner.metadata.stats().clone();
        stats.insert(TOTAL_STAT.to_string(), total as i64);
        Ok(Page {
            items,
            total,
            stats,
        })
    }

    /// Emit a `Sync` notification for every record, in insertion order.
    ///
    /// Returns the number of records replayed.
    pub fn sync(&self) -> Result<usize> {
        let records: Vec<(String, Value)> = if self.in_memory {
            let inner = self.inner.read();
            inner
                .order
                .iter()
                .filter_map(|k| inner.entries.get(k).map(|v| (k.clone(), v)))
                .map(|(k, v)| serde_json::to_value(v).map(|v| (k, v)))
                .collect::<serde_json::Result<_>>()?
        } else {
            self.storage()?.collect(&|_| true)?.into_iter().collect()
        };

        let _emit = self.emit.lock();
        for (key, value) in &records {
            let set = self.stamp_set(NotificationType::Sync, key.clone(), vec![
                NotificationChange::record(None, Some(value.to_string())),
            ]);
            if let Some(notifier) = &self.notifier {
                notifier.enqueue(set);
            }
        }
        Ok(records.len())
    }

    /// Register a metadata index and apply it to existing records
    pub fn add_metadata_func(
        &self,
        name: &str,
        f: impl Fn(&T) -> (bool, String) + Send + Sync + 'static,
    ) {
        let mut inner = self.inner.write();
        let Inner {
            entries, metadata, ..
        } = &mut *inner;
        metadata.add_func(name, Arc::new(f), entries.iter());
    }

    /// Register a statistic counter and apply it to existing records
    pub fn add_stat_func(&self, name: &str, p: impl Fn(&T) -> bool + Send + Sync + 'static) {
        let mut inner = self.inner.write();
        let Inner {
            entries, metadata, ..
        } = &mut *inner;
        metadata.add_stat(name, Arc::new(p), entries.values());
    }

    /// Keys in one bucket of a metadata index
    pub fn metadata(&self, name: &str, bucket: &str) -> Vec<String> {
        self.inner.read().metadata.bucket(name, bucket)
    }

    /// Bucket names of a metadata index
    pub fn metadata_buckets(&self, name: &str) -> Vec<String> {
        self.inner.read().metadata.buckets(name)
    }

    /// Statistic counters
    pub fn stats(&self) -> BTreeMap<String, i64> {
        self.inner.read().metadata.stats().clone()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        if !self.in_memory {
            return self
                .storage
                .as_ref()
                .and_then(|s| s.collect(&|_| true).ok())
                .map(|m| m.len())
                .unwrap_or(0);
        }
        self.inner.read().entries.len()
    }

    /// Empty cache
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys in insertion order
    pub fn keys(&self) -> Vec<String> {
        self.inner.read().order.clone()
    }

    /// Mutation stamp
    pub fn stamp(&self) -> u64 {
        self.inner.read().stamp
    }

    /// How many query plans were built so far
    pub fn plan_builds(&self) -> u64 {
        self.plan_builds.load(AtomicOrdering::SeqCst)
    }

    /// Last sequence number handed out
    pub fn last_sequence(&self) -> u64 {
        self.sequence.load(AtomicOrdering::SeqCst)
    }

    /// Notification sets the listener queue had no room for
    pub fn dropped_notifications(&self) -> u64 {
        self.notifier.as_ref().map_or(0, Notifier::dropped)
    }

    fn storage(&self) -> Result<&Arc<dyn Storage>> {
        self.storage
            .as_ref()
            .ok_or_else(|| Error::storage("cache has no storage sink"))
    }

    fn load(&self, inner: &Inner<T>, key: &str) -> Result<Option<T>> {
        if self.in_memory {
            return Ok(inner.entries.get(key).cloned());
        }
        match self.storage()?.get(key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    fn stamp_set(
        &self,
        kind: NotificationType,
        model_key: String,
        changes: Vec<NotificationChange>,
    ) -> NotificationSet {
        NotificationSet {
            sequence: self.sequence.fetch_add(1, AtomicOrdering::SeqCst) + 1,
            service: self.identity.service.clone(),
            model_type: self.identity.model_type.clone(),
            source: self.identity.source,
            model_key,
            kind,
            changes,
        }
    }

    /// Persist, number and queue a write. Caller holds `emit`.
    fn finish(&self, outcome: Outcome, notify: bool) -> Result<NotificationSet> {
        if let Some(storage) = &self.storage {
            let result = match &outcome.persist {
                Persist::Put(value) => storage.put(&outcome.key, value),
                Persist::Delete => storage.delete(&outcome.key).map(|_| ()),
            };
            if let Err(e) = result {
                if !self.in_memory {
                    return Err(e);
                }
                tracing::warn!(
                    service = %self.identity.service,
                    key = %outcome.key,
                    "Storage sink failed: {}",
                    e
                );
            }
        }

        let set = self.stamp_set(outcome.kind, outcome.key, outcome.changes);
        if notify {
            if let Some(notifier) = &self.notifier {
                notifier.enqueue(set.clone());
            }
        }
        Ok(set)
    }

    fn plan(&self, inner: &Inner<T>, query: &Query) -> Result<Arc<Vec<String>>> {
        let hash = xxh3_64(query.plan_signature().as_bytes());
        if let Some(plan) = self.plans.lock().get(&hash) {
            if plan.stamp == inner.stamp {
                return Ok(plan.keys.clone());
            }
        }

        let mut rows: Vec<(&String, Value)> = Vec::with_capacity(inner.order.len());
        for key in &inner.order {
            if let Some(record) = inner.entries.get(key) {
                let value = serde_json::to_value(record)?;
                if query.criteria.as_ref().is_none_or(|c| c.matches(&value)) {
                    rows.push((key, value));
                }
            }
        }
        sort_rows(&mut rows, query);

        let keys = Arc::new(rows.into_iter().map(|(k, _)| k.clone()).collect::<Vec<_>>());
        self.plan_builds.fetch_add(1, AtomicOrdering::SeqCst);
        self.plans.lock().insert(
            hash,
            Plan {
                stamp: inner.stamp,
                keys: keys.clone(),
            },
        );
        Ok(keys)
    }

    fn fetch_from_storage(&self, query: &Query) -> Result<Page<T>> {
        let storage = self.storage()?;
        let mut rows: Vec<(String, Value)> = storage
            .collect(&|v| query.criteria.as_ref().is_none_or(|c| c.matches(v)))?
            .into_iter()
            .collect();
        sort_rows(&mut rows, query);
        let total = rows.len();
        let (start, end) = page_bounds(total, query);
        let items = rows
            .drain(start..end)
            .map(|(_, v)| serde_json::from_value(v))
            .collect::<serde_json::Result<Vec<T>>>()?;

        let mut stats = BTreeMap::new();
        stats.insert(TOTAL_STAT.to_string(), total as i64);
        Ok(Page {
            items,
            total,
            stats,
        })
    }
}

/// Order keyed rows on the query's sort field
pub(crate) fn sort_rows<K: AsRef<str>>(rows: &mut [(K, Value)], query: &Query) {
    if let Some(field) = &query.sort_by {
        rows.sort_by(|(ka, a), (kb, b)| {
            let ord = sort_order(
                field_value(a, field).unwrap_or(&Value::Null),
                field_value(b, field).unwrap_or(&Value::Null),
                ka.as_ref(),
                kb.as_ref(),
            );
            if query.descending { ord.reverse() } else { ord }
        });
    }
}

/// Row range of the requested page
pub(crate) fn page_bounds(len: usize, query: &Query) -> (usize, usize) {
    let start = query.offset().min(len);
    let end = if query.limit == 0 {
        len
    } else {
        start.saturating_add(query.limit).min(len)
    };
    (start, end)
}

/// Total order for sorting on a field: numbers, then strings, then bools,
/// then everything else. Values that cannot be compared fall back to key
/// order.
fn sort_order(a: &Value, b: &Value, key_a: &str, key_b: &str) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Number(_) => 0,
            Value::String(_) => 1,
            Value::Bool(_) => 2,
            _ => 3,
        }
    }
    rank(a).cmp(&rank(b)).then_with(|| match compare_values(a, b) {
        Some(ord) => ord,
        None => key_a.cmp(key_b),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MyEnum, RecordingListener, TestRecord, wait_until_sync};
    use plexus_protocol::{Criteria, Operator};
    use std::time::Duration;

    fn identity() -> CacheIdentity {
        CacheIdentity {
            service: ServiceKey::new("Tests", 0),
            source: PeerId::random(),
            model_type: "TestRecord".into(),
        }
    }

    fn cache() -> Cache<TestRecord> {
        Cache::new(identity())
    }

    #[test]
    fn test_post_inserts_then_replaces() {
        let cache = cache();
        let set = cache.post(&TestRecord::new("a", 1), true).unwrap().unwrap();
        assert_eq!(set.kind, NotificationType::Add);
        assert_eq!(set.model_key, "a");
        assert_eq!(cache.len(), 1);

        // identical write is a no-op
        assert!(cache.post(&TestRecord::new("a", 1), true).unwrap().is_none());

        let set = cache.put(&TestRecord::new("a", 2), true).unwrap().unwrap();
        assert_eq!(set.kind, NotificationType::Replace);
        assert_eq!(set.changes.len(), 1);
        assert!(set.changes[0].old_value.as_deref().unwrap().contains("\"MyInt\":1"));
        assert!(set.changes[0].new_value.as_deref().unwrap().contains("\"MyInt\":2"));
        assert_eq!(cache.get_by_key("a").unwrap().my_int, Some(2));
    }

    #[test]
    fn test_post_clears_with_null_patch_does_not() {
        let cache = cache();
        let mut full = TestRecord::new("a", 1);
        full.my_enum = Some(MyEnum::One);
        cache.post(&full, true).unwrap();

        let mut partial = TestRecord::key("a");
        partial.my_enum = Some(MyEnum::Two);
        let set = cache.patch(&partial, true).unwrap().unwrap();
        assert_eq!(set.kind, NotificationType::Update);
        assert_eq!(set.changes.len(), 1);
        assert_eq!(set.changes[0].property_id, "MyEnum");
        let stored = cache.get_by_key("a").unwrap();
        assert_eq!(stored.my_int, Some(1));
        assert_eq!(stored.my_enum, Some(MyEnum::Two));

        cache.post(&partial, true).unwrap();
        assert_eq!(cache.get_by_key("a").unwrap().my_int, None);
    }

    #[test]
    fn test_patch_absent_key_posts() {
        let cache = cache();
        let set = cache.patch(&TestRecord::new("z", 9), true).unwrap().unwrap();
        assert_eq!(set.kind, NotificationType::Add);
    }

    #[test]
    fn test_delete() {
        let cache = cache();
        cache.post(&TestRecord::new("a", 1), true).unwrap();
        cache.post(&TestRecord::new("b", 2), true).unwrap();
        let set = cache.delete(&TestRecord::key("a"), true).unwrap().unwrap();
        assert_eq!(set.kind, NotificationType::Delete);
        assert!(set.snapshot().unwrap().contains("\"MyString\":\"a\""));
        assert_eq!(cache.keys(), vec!["b"]);
        assert!(matches!(
            cache.delete(&TestRecord::key("a"), true),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(cache.get_by_key("a"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_missing_key_is_validation_error() {
        let cache = cache();
        let result = cache.post_value(serde_json::json!({"MyInt": 1}), true);
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_read_isolation() {
        let cache = cache();
        cache.post(&TestRecord::new("a", 1), true).unwrap();

        let mut mine = cache.get_by_key("a").unwrap();
        mine.my_int = Some(1000);
        mine.tags.get_or_insert_with(Vec::new).push("mutated".into());

        let theirs = cache.get_by_key("a").unwrap();
        assert_eq!(theirs.my_int, Some(1));
        assert!(theirs.tags.is_none());
    }

    #[test]
    fn test_write_isolation() {
        let cache = cache();
        let mut record = TestRecord::new("a", 1);
        cache.post(&record, true).unwrap();
        record.my_int = Some(50);
        assert_eq!(cache.get_by_key("a").unwrap().my_int, Some(1));
    }

    #[test]
    fn test_sequence_strictly_increasing() {
        let cache = cache();
        let mut last = 0;
        for i in 0..20 {
            let set = cache
                .post(&TestRecord::new(&format!("k{}", i % 5), i), true)
                .unwrap()
                .unwrap();
            assert!(set.sequence > last);
            last = set.sequence;
        }
        assert_eq!(cache.last_sequence(), last);
    }

    #[test]
    fn test_listener_receives_in_order() {
        let listener = Arc::new(RecordingListener::default());
        let cache = Cache::<TestRecord>::new(identity())
            .with_listener(listener.clone(), 4)
            .unwrap();
        for i in 0..50 {
            cache.post(&TestRecord::new(&format!("k{i}"), i), true).unwrap();
        }
        // suppressed writes are not delivered
        cache.post(&TestRecord::new("quiet", 0), false).unwrap();

        assert!(wait_until_sync(Duration::from_secs(5), || listener.len() == 50));
        let seqs = listener.sequences();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(listener.count(NotificationType::Add), 50);
    }

    #[test]
    fn test_fetch_natural_order_and_paging() {
        let cache = cache();
        for (i, k) in ["c", "a", "b", "e", "d"].iter().enumerate() {
            cache.post(&TestRecord::new(k, i as i64), true).unwrap();
        }
        let page = cache.fetch(&Query::page(1, 2)).unwrap();
        assert_eq!(page.total, 5);
        let keys: Vec<_> = page.items.iter().map(|r| r.my_string.clone()).collect();
        assert_eq!(keys, vec!["b", "e"]);
        assert_eq!(page.stats[TOTAL_STAT], 5);
        // natural order does not build plans
        assert_eq!(cache.plan_builds(), 0);
    }

    #[test]
    fn test_fetch_filter_and_sort() {
        let cache = cache();
        for (k, n) in [("a", 5), ("b", 1), ("c", 9), ("d", 3)] {
            cache.post(&TestRecord::new(k, n), true).unwrap();
        }
        let query = Query::all()
            .with_criteria(Criteria::cond("MyInt", Operator::Gt, 2))
            .sorted_by("MyInt");
        let page = cache.fetch(&query).unwrap();
        let keys: Vec<_> = page.items.iter().map(|r| r.my_string.as_str()).collect();
        assert_eq!(keys, vec!["d", "a", "c"]);
        assert_eq!(page.total, 3);

        let desc = cache.fetch(&query.clone().descending()).unwrap();
        let keys: Vec<_> = desc.items.iter().map(|r| r.my_string.as_str()).collect();
        assert_eq!(keys, vec!["c", "a", "d"]);
    }

    #[test]
    fn test_incomparable_sort_falls_back_to_key() {
        let cache = cache();
        cache.post(&TestRecord::key("b"), true).unwrap();
        cache.post(&TestRecord::new("c", 1), true).unwrap();
        cache.post(&TestRecord::key("a"), true).unwrap();
        let page = cache.fetch(&Query::all().sorted_by("MyInt")).unwrap();
        let keys: Vec<_> = page.items.iter().map(|r| r.my_string.as_str()).collect();
        // numbers first, then the nulls by key
        assert_eq!(keys, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_plan_cache_invalidated_by_stamp() {
        let cache = cache();
        cache.post(&TestRecord::new("a", 1), true).unwrap();
        let query = Query::page(0, 10).sorted_by("MyInt");

        cache.fetch(&query).unwrap();
        cache.fetch(&Query::page(1, 10).sorted_by("MyInt")).unwrap();
        assert_eq!(cache.plan_builds(), 1);

        let stamp = cache.stamp();
        cache.post(&TestRecord::new("b", 0), true).unwrap();
        assert!(cache.stamp() > stamp);

        let page = cache.fetch(&query).unwrap();
        assert_eq!(cache.plan_builds(), 2);
        assert_eq!(page.items[0].my_string, "b");
    }

    #[test]
    fn test_metadata_and_stats() {
        let cache = cache();
        cache.post(&TestRecord::new("a", 1), true).unwrap();
        cache.post(&TestRecord::new("b", 2), true).unwrap();
        cache.add_metadata_func("parity", |r: &TestRecord| {
            let n = r.my_int.unwrap_or(0);
            (true, if n % 2 == 0 { "even" } else { "odd" }.to_string())
        });
        cache.add_stat_func("positive", |r: &TestRecord| r.my_int.unwrap_or(0) > 0);
        assert_eq!(cache.metadata("parity", "odd"), vec!["a"]);
        assert_eq!(cache.stats()["positive"], 2);

        cache.put(&TestRecord::new("a", 4), true).unwrap();
        assert_eq!(cache.metadata("parity", "even"), vec!["a", "b"]);
        cache.delete_key("b", true).unwrap();
        assert_eq!(cache.stats()["positive"], 1);
        assert_eq!(cache.fetch(&Query::all()).unwrap().stats["positive"], 1);
    }

    #[test]
    fn test_storage_sink_receives_writes() {
        let storage = Arc::new(MemoryStorage::new());
        let cache = Cache::<TestRecord>::new(identity())
            .with_storage(storage.clone(), true)
            .unwrap();
        cache.post(&TestRecord::new("a", 1), true).unwrap();
        cache.post(&TestRecord::new("b", 1), true).unwrap();
        cache.delete_key("a", true).unwrap();
        assert_eq!(storage.len(), 1);

        // a new cache over the same sink starts warm
        let warm = Cache::<TestRecord>::new(identity())
            .with_storage(storage, true)
            .unwrap();
        assert_eq!(warm.get_by_key("b").unwrap().my_int, Some(1));
    }

    #[test]
    fn test_storage_only_cache_reads_storage() {
        let storage = Arc::new(MemoryStorage::new());
        let cache = Cache::<TestRecord>::new(identity())
            .with_storage(storage.clone(), false)
            .unwrap();
        cache.post(&TestRecord::new("a", 1), true).unwrap();
        cache.patch(&TestRecord::new("a", 3), true).unwrap();
        assert_eq!(cache.get_by_key("a").unwrap().my_int, Some(3));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.fetch(&Query::all()).unwrap().total, 1);
        assert!(cache.keys().is_empty());
        assert_eq!(storage.get("a").unwrap().unwrap()["MyInt"], 3);
    }

    #[test]
    fn test_sync_replays_everything() {
        let listener = Arc::new(RecordingListener::default());
        let cache = Cache::<TestRecord>::new(identity())
            .with_listener(listener.clone(), 16)
            .unwrap();
        cache.post(&TestRecord::new("a", 1), false).unwrap();
        cache.post(&TestRecord::new("b", 2), false).unwrap();
        assert_eq!(cache.sync().unwrap(), 2);
        assert!(wait_until_sync(Duration::from_secs(5), || listener.len() == 2));
        assert_eq!(listener.count(NotificationType::Sync), 2);
    }
}
