//! Secondary indexes and statistic counters maintained by a cache

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Extractor for a metadata index: `(matched, bucket)`
pub type MetadataFn<T> = Arc<dyn Fn(&T) -> (bool, String) + Send + Sync>;

/// Predicate for a statistic counter
pub type StatFn<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Named indexes (`name -> bucket -> keys`) and counters (`name -> count`)
pub(crate) struct Metadata<T> {
    funcs: BTreeMap<String, MetadataFn<T>>,
    index: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
    stat_funcs: BTreeMap<String, StatFn<T>>,
    stats: BTreeMap<String, i64>,
}

impl<T> Default for Metadata<T> {
    fn default() -> Self {
        Self {
            funcs: BTreeMap::new(),
            index: BTreeMap::new(),
            stat_funcs: BTreeMap::new(),
            stats: BTreeMap::new(),
        }
    }
}

impl<T> Metadata<T> {
    /// Register an extractor and index the existing records with it
    pub fn add_func<'a>(
        &mut self,
        name: &str,
        f: MetadataFn<T>,
        existing: impl Iterator<Item = (&'a String, &'a T)>,
    ) where
        T: 'a,
    {
        let mut buckets: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (key, record) in existing {
            let (matched, bucket) = f(record);
            if matched {
                buckets.entry(bucket).or_default().insert(key.clone());
            }
        }
        self.index.insert(name.to_string(), buckets);
        self.funcs.insert(name.to_string(), f);
    }

    /// Register a counter and count the existing records with it
    pub fn add_stat<'a>(
        &mut self,
        name: &str,
        p: StatFn<T>,
        existing: impl Iterator<Item = &'a T>,
    ) where
        T: 'a,
    {
        let count = existing.filter(|r| p(r)).count() as i64;
        self.stats.insert(name.to_string(), count);
        self.stat_funcs.insert(name.to_string(), p);
    }

    /// Account for a record entering the cache
    pub fn on_insert(&mut self, key: &str, record: &T) {
        for (name, f) in &self.funcs {
            let (matched, bucket) = f(record);
            if matched {
                self.index
                    .entry(name.clone())
                    .or_default()
                    .entry(bucket)
                    .or_default()
                    .insert(key.to_string());
            }
        }
        for (name, p) in &self.stat_funcs {
            if p(record) {
                *self.stats.entry(name.clone()).or_insert(0) += 1;
            }
        }
    }

    /// Account for a record leaving the cache
    pub fn on_remove(&mut self, key: &str, record: &T) {
        for (name, f) in &self.funcs {
            let (matched, bucket) = f(record);
            if !matched {
                continue;
            }
            if let Some(buckets) = self.index.get_mut(name) {
                if let Some(keys) = buckets.get_mut(&bucket) {
                    keys.remove(key);
                    if keys.is_empty() {
                        buckets.remove(&bucket);
                    }
                }
            }
        }
        for (name, p) in &self.stat_funcs {
            if p(record) {
                if let Some(count) = self.stats.get_mut(name) {
                    *count -= 1;
                }
            }
        }
    }

    /// Keys in one bucket of one index
    pub fn bucket(&self, name: &str, bucket: &str) -> Vec<String> {
        self.index
            .get(name)
            .and_then(|b| b.get(bucket))
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Bucket names of one index
    pub fn buckets(&self, name: &str) -> Vec<String> {
        self.index
            .get(name)
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Current counters
    pub fn stats(&self) -> &BTreeMap<String, i64> {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_and_stats_follow_records() {
        let mut md: Metadata<i64> = Metadata::default();
        let existing = vec![("a".to_string(), 1i64), ("b".to_string(), 2i64)];
        md.add_func(
            "parity",
            Arc::new(|v: &i64| (true, if v % 2 == 0 { "even" } else { "odd" }.to_string())),
            existing.iter().map(|(k, v)| (k, v)),
        );
        md.add_stat("big", Arc::new(|v: &i64| *v > 1), existing.iter().map(|(_, v)| v));

        assert_eq!(md.bucket("parity", "odd"), vec!["a"]);
        assert_eq!(md.stats()["big"], 1);

        md.on_insert("c", &4);
        assert_eq!(md.bucket("parity", "even"), vec!["b", "c"]);
        assert_eq!(md.stats()["big"], 2);

        md.on_remove("a", &1);
        assert!(md.bucket("parity", "odd").is_empty());
        assert_eq!(md.buckets("parity"), vec!["even"]);
        assert_eq!(md.stats()["big"], 2);
    }
}
