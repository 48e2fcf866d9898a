//! Storage sinks a cache can persist to

use crate::{Error, Result};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Persistent sink for cache records, keyed like the cache itself
pub trait Storage: Send + Sync {
    /// Store a record under its key
    fn put(&self, key: &str, value: &Value) -> Result<()>;

    /// Load a record
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// All records matching a predicate
    fn collect(&self, predicate: &dyn Fn(&Value) -> bool) -> Result<BTreeMap<String, Value>>;

    /// Remove a record, returning it
    fn delete(&self, key: &str) -> Result<Option<Value>>;
}

/// In-memory sink, mostly useful for tests and storage-only caches
#[derive(Debug, Default)]
pub struct MemoryStorage {
    records: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStorage {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Nothing stored
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl Storage for MemoryStorage {
    fn put(&self, key: &str, value: &Value) -> Result<()> {
        self.records.write().insert(key.to_string(), value.clone());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.records.read().get(key).cloned())
    }

    fn collect(&self, predicate: &dyn Fn(&Value) -> bool) -> Result<BTreeMap<String, Value>> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|(_, v)| predicate(v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn delete(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.records.write().remove(key))
    }
}

/// One JSON file per record inside a directory.
///
/// File names are the hex encoding of the key so any key is a valid name.
#[derive(Debug)]
pub struct JsonFileStorage {
    dir: PathBuf,
    // serializes writers against directory scans
    lock: RwLock<()>,
}

impl JsonFileStorage {
    /// Open (and create) a storage directory
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            lock: RwLock::new(()),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key.bytes().map(|b| format!("{b:02x}")).collect();
        self.dir.join(format!("{name}.json"))
    }

    fn key_from_file(name: &str) -> Option<String> {
        let hex = name.strip_suffix(".json")?;
        if hex.len() % 2 != 0 {
            return None;
        }
        let bytes: Option<Vec<u8>> = (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
            .collect();
        String::from_utf8(bytes?).ok()
    }

    fn read(path: &Path) -> Result<Option<Value>> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| Error::storage(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl Storage for JsonFileStorage {
    fn put(&self, key: &str, value: &Value) -> Result<()> {
        let _guard = self.lock.write();
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(value)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Value>> {
        let _guard = self.lock.read();
        Self::read(&self.path_for(key))
    }

    fn collect(&self, predicate: &dyn Fn(&Value) -> bool) -> Result<BTreeMap<String, Value>> {
        let _guard = self.lock.read();
        let mut out = BTreeMap::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(key) = name.to_str().and_then(Self::key_from_file) else {
                continue;
            };
            if let Some(value) = Self::read(&entry.path())? {
                if predicate(&value) {
                    out.insert(key, value);
                }
            }
        }
        Ok(out)
    }

    fn delete(&self, key: &str) -> Result<Option<Value>> {
        let _guard = self.lock.write();
        let path = self.path_for(key);
        let existing = Self::read(&path)?;
        if existing.is_some() {
            std::fs::remove_file(&path)?;
        }
        Ok(existing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn exercise(storage: &dyn Storage) {
        storage.put("a", &json!({"MyString": "a", "MyInt": 1})).unwrap();
        storage.put("b/..", &json!({"MyString": "b/..", "MyInt": 2})).unwrap();
        assert_eq!(storage.get("a").unwrap(), Some(json!({"MyString": "a", "MyInt": 1})));
        assert_eq!(storage.get("zzz").unwrap(), None);

        let big = storage.collect(&|v| v["MyInt"].as_i64() > Some(1)).unwrap();
        assert_eq!(big.keys().collect::<Vec<_>>(), vec!["b/.."]);

        assert!(storage.delete("a").unwrap().is_some());
        assert!(storage.delete("a").unwrap().is_none());
        assert_eq!(storage.collect(&|_| true).unwrap().len(), 1);
    }

    #[test]
    fn test_memory_storage() {
        exercise(&MemoryStorage::new());
    }

    #[test]
    fn test_json_file_storage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonFileStorage::open(dir.path().join("records")).unwrap();
        exercise(&storage);
        // a reopened sink sees the same data
        let reopened = JsonFileStorage::open(dir.path().join("records")).unwrap();
        assert!(reopened.get("b/..").unwrap().is_some());
    }
}
