//! Flat key-value object store interface and the in-memory implementation

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use crate::Result;

/// Remote object store holding flat string keys.
///
/// "Directories" do not exist at this level; they are inferred by callers
/// from common key prefixes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch a value. `None` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store a value, replacing any previous one.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// All keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Size of the value at `key`, or `None` if it does not exist.
    async fn head(&self, key: &str) -> Result<Option<u64>>;

    /// Fetch many keys in one logical round trip. Missing keys are left
    /// out of the result.
    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Bytes>> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(data) = self.get(key).await? {
                found.insert(key.clone(), data);
            }
        }
        Ok(found)
    }
}

/// Per-operation request counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreOpStats {
    pub gets: u64,
    pub puts: u64,
    pub deletes: u64,
    pub lists: u64,
    pub heads: u64,
    pub batch_gets: u64,
}

impl StoreOpStats {
    /// Total number of calls that would have hit the network.
    pub fn round_trips(&self) -> u64 {
        self.gets + self.puts + self.deletes + self.lists + self.heads + self.batch_gets
    }
}

#[derive(Debug, Default)]
struct OpCounters {
    gets: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
    lists: AtomicU64,
    heads: AtomicU64,
    batch_gets: AtomicU64,
}

/// In-memory object store.
///
/// Counts every call so tests can check how many round trips a git
/// operation would have cost against a real bucket.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    data: RwLock<BTreeMap<String, Bytes>>,
    ops: OpCounters,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the request counters.
    pub fn stats(&self) -> StoreOpStats {
        StoreOpStats {
            gets: self.ops.gets.load(Ordering::Relaxed),
            puts: self.ops.puts.load(Ordering::Relaxed),
            deletes: self.ops.deletes.load(Ordering::Relaxed),
            lists: self.ops.lists.load(Ordering::Relaxed),
            heads: self.ops.heads.load(Ordering::Relaxed),
            batch_gets: self.ops.batch_gets.load(Ordering::Relaxed),
        }
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.data.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All keys, sorted
    pub fn keys(&self) -> Vec<String> {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.ops.gets.fetch_add(1, Ordering::Relaxed);
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        Ok(data.get(key).cloned())
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.ops.puts.fetch_add(1, Ordering::Relaxed);
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ops.deletes.fetch_add(1, Ordering::Relaxed);
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.ops.lists.fetch_add(1, Ordering::Relaxed);
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn head(&self, key: &str) -> Result<Option<u64>> {
        self.ops.heads.fetch_add(1, Ordering::Relaxed);
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        Ok(data.get(key).map(|v| v.len() as u64))
    }

    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Bytes>> {
        self.ops.batch_gets.fetch_add(1, Ordering::Relaxed);
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        Ok(keys
            .iter()
            .filter_map(|key| data.get(key).map(|v| (key.clone(), v.clone())))
            .collect())
    }
}
