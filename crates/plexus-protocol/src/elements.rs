//! Type-erased payload handed to service handlers

use crate::Query;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Stat key holding the number of records a query matched before paging
pub const TOTAL_STAT: &str = "Total";

/// Records (in their serde form) plus an optional query, statistics and
/// error text. Requests and replies both use it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Elements {
    /// Records
    pub items: Vec<Value>,
    /// Query for paged reads
    pub query: Option<Query>,
    /// Named counters (`Total` plus registered stat functions)
    pub stats: BTreeMap<String, i64>,
    /// Error reported by the producer of these elements
    pub error: Option<String>,
}

impl Elements {
    /// No records
    pub fn empty() -> Self {
        Self::default()
    }

    /// A single record
    pub fn one(item: Value) -> Self {
        Self {
            items: vec![item],
            ..Self::default()
        }
    }

    /// Several records
    pub fn many(items: Vec<Value>) -> Self {
        Self {
            items,
            ..Self::default()
        }
    }

    /// A query with no records
    pub fn query(query: Query) -> Self {
        Self {
            query: Some(query),
            ..Self::default()
        }
    }

    /// An error reply
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            error: Some(msg.into()),
            ..Self::default()
        }
    }

    /// Serialize a typed record into a single-element payload
    pub fn from_record<T: Serialize>(record: &T) -> serde_json::Result<Self> {
        Ok(Self::one(serde_json::to_value(record)?))
    }

    /// Deserialize every record
    pub fn to_records<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<Vec<T>> {
        self.items
            .iter()
            .map(|v| serde_json::from_value(v.clone()))
            .collect()
    }

    /// First record, if any
    pub fn first(&self) -> Option<&Value> {
        self.items.first()
    }

    /// No records
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// The `Total` stat, falling back to the number of records
    pub fn total(&self) -> usize {
        self.stats
            .get(TOTAL_STAT)
            .map(|t| (*t).max(0) as usize)
            .unwrap_or(self.items.len())
    }

    /// Copy without records (keeps query and stats)
    pub fn stripped(&self) -> Self {
        Self {
            items: Vec::new(),
            query: self.query.clone(),
            stats: self.stats.clone(),
            error: self.error.clone(),
        }
    }

    /// Append the records of another payload and add up its stats
    pub fn merge(&mut self, other: Elements) {
        self.items.extend(other.items);
        for (name, count) in other.stats {
            *self.stats.entry(name).or_insert(0) += count;
        }
        if self.error.is_none() {
            self.error = other.error;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_total_falls_back_to_len() {
        let mut e = Elements::many(vec![json!(1), json!(2)]);
        assert_eq!(e.total(), 2);
        e.stats.insert(TOTAL_STAT.into(), 40);
        assert_eq!(e.total(), 40);
    }

    #[test]
    fn test_merge_adds_stats() {
        let mut a = Elements::one(json!({"k": 1}));
        a.stats.insert(TOTAL_STAT.into(), 1);
        let mut b = Elements::one(json!({"k": 2}));
        b.stats.insert(TOTAL_STAT.into(), 3);
        a.merge(b);
        assert_eq!(a.len(), 2);
        assert_eq!(a.total(), 4);
    }

    #[test]
    fn test_stripped_drops_items() {
        let e = Elements {
            items: vec![json!(1)],
            query: Some(Query::page(1, 5)),
            ..Elements::default()
        };
        let s = e.stripped();
        assert!(s.is_empty());
        assert_eq!(s.query, e.query);
    }
}
