//! Process-wide content and listing cache shared by all adapters.
//!
//! Loose git objects never change once written, so their content can be
//! shared across requests indefinitely. Everything else in a repository
//! (`HEAD`, `refs/*`, `config`, `packed-refs`) is mutable and only cached for
//! `mutable_ttl`, which defaults to zero: a concurrent reader must never be
//! served a stale ref pointer from here.

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::trace;

/// Whether a key's value can change after it is first written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyClass {
    Immutable,
    Mutable,
}

impl KeyClass {
    /// Classify a repository-relative path.
    pub fn of_relative_path(path: &str) -> Self {
        if path.starts_with("objects/") && !path.starts_with("objects/info/") {
            KeyClass::Immutable
        } else {
            KeyClass::Mutable
        }
    }
}

/// Limits and lifetimes for [`SharedCache`].
#[derive(Debug, Clone)]
pub struct CachePolicy {
    /// Maximum number of content entries
    pub max_entries: usize,
    /// Maximum total bytes of cached content
    pub max_bytes: u64,
    /// Lifetime of mutable content entries. Zero disables caching them.
    pub mutable_ttl: Duration,
    /// Lifetime of listing entries. Zero disables listing caching.
    pub listing_ttl: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
            max_bytes: 256 * 1024 * 1024,
            mutable_ttl: Duration::ZERO,
            listing_ttl: Duration::from_secs(1),
        }
    }
}

/// Cache hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub bytes: u64,
}

#[derive(Debug)]
struct ContentEntry {
    data: Bytes,
    class: KeyClass,
    inserted: Instant,
    order: u64,
}

#[derive(Debug)]
struct ListingEntry {
    keys: Arc<Vec<String>>,
    inserted: Instant,
}

#[derive(Debug, Default)]
struct CacheInner {
    contents: HashMap<String, ContentEntry>,
    /// Insertion order → key, oldest first
    order: BTreeMap<u64, String>,
    listings: HashMap<String, ListingEntry>,
    next_order: u64,
    total_bytes: u64,
}

impl CacheInner {
    fn remove_content(&mut self, key: &str) -> Option<ContentEntry> {
        let entry = self.contents.remove(key)?;
        self.order.remove(&entry.order);
        self.total_bytes -= entry.data.len() as u64;
        Some(entry)
    }

    /// Drop listings whose prefix covers `key`.
    fn invalidate_listings_for(&mut self, key: &str) {
        self.listings.retain(|prefix, _| !key.starts_with(prefix.as_str()));
    }
}

/// Content/listing cache shared across adapter instances.
///
/// Construct once at startup and hand an `Arc` to every [`crate::BucketFs`].
#[derive(Debug, Default)]
pub struct SharedCache {
    policy: CachePolicy,
    inner: RwLock<CacheInner>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl SharedCache {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            policy,
            inner: RwLock::new(CacheInner::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Look up cached content for an absolute key.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let found = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            inner.contents.get(key).and_then(|entry| {
                let fresh = entry.class == KeyClass::Immutable
                    || entry.inserted.elapsed() < self.policy.mutable_ttl;
                fresh.then(|| entry.data.clone())
            })
        };

        match found {
            Some(data) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(data)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Cache content for an absolute key.
    pub fn put(&self, key: &str, data: Bytes, class: KeyClass) {
        if class == KeyClass::Mutable && self.policy.mutable_ttl.is_zero() {
            return;
        }
        if data.len() as u64 > self.policy.max_bytes || self.policy.max_entries == 0 {
            return;
        }

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.remove_content(key);

        let order = inner.next_order;
        inner.next_order += 1;
        inner.total_bytes += data.len() as u64;
        inner.order.insert(order, key.to_string());
        inner.contents.insert(
            key.to_string(),
            ContentEntry {
                data,
                class,
                inserted: Instant::now(),
                order,
            },
        );

        self.evict(&mut inner);
    }

    /// Forget cached content for a key.
    pub fn invalidate(&self, key: &str) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.remove_content(key);
    }

    /// Record that `key` was written through some adapter.
    pub fn note_write(&self, key: &str, data: &Bytes, class: KeyClass) {
        {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            inner.remove_content(key);
            inner.invalidate_listings_for(key);
        }
        self.put(key, data.clone(), class);
    }

    /// Record that `key` was deleted through some adapter.
    pub fn note_delete(&self, key: &str) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.remove_content(key);
        inner.invalidate_listings_for(key);
    }

    /// Cached listing for a key prefix.
    pub fn get_listing(&self, prefix: &str) -> Option<Arc<Vec<String>>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .listings
            .get(prefix)
            .filter(|entry| entry.inserted.elapsed() < self.policy.listing_ttl)
            .map(|entry| entry.keys.clone())
    }

    /// Cache the keys found under a prefix.
    pub fn put_listing(&self, prefix: &str, keys: Vec<String>) {
        if self.policy.listing_ttl.is_zero() {
            return;
        }
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.listings.insert(
            prefix.to_string(),
            ListingEntry {
                keys: Arc::new(keys),
                inserted: Instant::now(),
            },
        );
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: inner.contents.len(),
            bytes: inner.total_bytes,
        }
    }

    /// Evict oldest entries until under both limits
    fn evict(&self, inner: &mut CacheInner) {
        while inner.contents.len() > self.policy.max_entries
            || inner.total_bytes > self.policy.max_bytes
        {
            let Some((_, key)) = inner.order.pop_first() else {
                break;
            };
            if let Some(entry) = inner.contents.remove(&key) {
                inner.total_bytes -= entry.data.len() as u64;
                self.evictions.fetch_add(1, Ordering::Relaxed);
                trace!("evicted {} from shared cache", key);
            }
        }
    }
}
