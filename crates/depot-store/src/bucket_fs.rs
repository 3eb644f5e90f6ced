//! Per-request filesystem adapter over one repository's key prefix.
//!
//! A `BucketFs` lives for one inbound request. It remembers everything it
//! has learned about the store (content, confirmed absence, sizes, prefix
//! listings) so one git operation never asks the store the same question
//! twice. Immutable object content is additionally shared across requests
//! through [`SharedCache`].

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

use crate::cache::{KeyClass, SharedCache};
use crate::fs::{Metadata, RepoFs};
use crate::path::{child_name, dir_prefix, normalize, resolve_key};
use crate::store::ObjectStore;
use crate::{Error, Result};

/// Key-listing strategy chosen when the adapter is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Prefetch {
    /// Point lookups on demand. Best when one large read dominates.
    #[default]
    None,
    /// List every key under the prefix up front and answer existence and
    /// listing queries from that snapshot. Best for history and tree walks.
    AllKeys,
}

/// Result of a content lookup that reached a definite answer.
#[derive(Debug, Clone)]
enum Lookup {
    Found(Bytes),
    Absent,
}

#[derive(Debug, Default)]
struct LocalState {
    contents: HashMap<String, Lookup>,
    /// Key prefix → every key starting with it
    listings: HashMap<String, BTreeSet<String>>,
    exists: HashMap<String, bool>,
    sizes: HashMap<String, u64>,
    /// All keys under the repository prefix, when prefetched
    all_keys: Option<BTreeSet<String>>,
    dir_markers: HashSet<String>,
    /// Keys whose absence must be re-checked against the store
    stale: HashSet<String>,
}

impl LocalState {
    fn remember(&mut self, key: &str, data: &Bytes) {
        self.contents.insert(key.to_string(), Lookup::Found(data.clone()));
        self.exists.insert(key.to_string(), true);
        self.sizes.insert(key.to_string(), data.len() as u64);
    }

    fn remember_absent(&mut self, key: &str) {
        self.contents.insert(key.to_string(), Lookup::Absent);
        self.exists.insert(key.to_string(), false);
        self.sizes.remove(key);
    }

    fn known_absent(&self, key: &str) -> bool {
        if self.exists.get(key) == Some(&false) {
            return true;
        }
        match &self.all_keys {
            Some(keys) => !keys.contains(key) && !self.stale.contains(key),
            None => false,
        }
    }

    fn note_written(&mut self, key: &str, data: &Bytes) {
        self.remember(key, data);
        self.stale.remove(key);
        if let Some(keys) = self.all_keys.as_mut() {
            keys.insert(key.to_string());
        }
        for (prefix, keys) in self.listings.iter_mut() {
            if key.starts_with(prefix.as_str()) {
                keys.insert(key.to_string());
            }
        }
    }

    fn note_deleted(&mut self, key: &str) {
        self.remember_absent(key);
        self.stale.remove(key);
        if let Some(keys) = self.all_keys.as_mut() {
            keys.remove(key);
        }
        for keys in self.listings.values_mut() {
            keys.remove(key);
        }
    }

    fn keys_from_snapshot(&self, prefix: &str) -> Option<BTreeSet<String>> {
        let keys = self.all_keys.as_ref()?;
        Some(
            keys.range(prefix.to_string()..)
                .take_while(|key| key.starts_with(prefix))
                .cloned()
                .collect(),
        )
    }
}

/// [`RepoFs`] over the keys under one storage prefix.
pub struct BucketFs {
    store: Arc<dyn ObjectStore>,
    cache: Arc<SharedCache>,
    prefix: String,
    state: Mutex<LocalState>,
}

impl BucketFs {
    /// Create an adapter that looks everything up on demand.
    pub fn new(store: Arc<dyn ObjectStore>, cache: Arc<SharedCache>, prefix: &str) -> Self {
        Self {
            store,
            cache,
            prefix: normalize(prefix),
            state: Mutex::new(LocalState::default()),
        }
    }

    /// Create an adapter, listing every key under the prefix first when
    /// `prefetch` asks for it.
    pub async fn open(
        store: Arc<dyn ObjectStore>,
        cache: Arc<SharedCache>,
        prefix: &str,
        prefetch: Prefetch,
    ) -> Result<Self> {
        let fs = Self::new(store, cache, prefix);
        if prefetch == Prefetch::AllKeys {
            let keys = fs.store.list(&dir_prefix(&fs.prefix)).await?;
            debug!("prefetched {} keys under {}", keys.len(), fs.prefix);
            fs.state().all_keys = Some(keys.into_iter().collect());
        }
        Ok(fs)
    }

    /// Storage prefix this adapter is scoped to.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether the all-keys snapshot is loaded.
    pub fn is_prefetched(&self) -> bool {
        self.state().all_keys.is_some()
    }

    fn state(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key(&self, path: &str) -> String {
        resolve_key(&self.prefix, path)
    }

    fn class(&self, key: &str) -> KeyClass {
        let relative = key
            .strip_prefix(&self.prefix)
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(key);
        KeyClass::of_relative_path(relative)
    }

    /// Every key starting with `prefix`, from the cheapest source that has it.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<BTreeSet<String>> {
        {
            let state = self.state();
            if let Some(keys) = state.listings.get(prefix) {
                return Ok(keys.clone());
            }
        }

        if let Some(keys) = self.cache.get_listing(prefix) {
            let keys: BTreeSet<String> = keys.iter().cloned().collect();
            self.state().listings.insert(prefix.to_string(), keys.clone());
            return Ok(keys);
        }

        {
            let mut state = self.state();
            if let Some(keys) = state.keys_from_snapshot(prefix) {
                state.listings.insert(prefix.to_string(), keys.clone());
                return Ok(keys);
            }
        }

        trace!("list {}", prefix);
        let listed = self.store.list(prefix).await?;
        self.cache.put_listing(prefix, listed.clone());
        let keys: BTreeSet<String> = listed.into_iter().collect();
        self.state().listings.insert(prefix.to_string(), keys.clone());
        Ok(keys)
    }

    async fn size_of(&self, key: &str) -> Result<Option<u64>> {
        {
            let state = self.state();
            if let Some(size) = state.sizes.get(key) {
                return Ok(Some(*size));
            }
            if let Some(Lookup::Found(data)) = state.contents.get(key) {
                return Ok(Some(data.len() as u64));
            }
        }

        trace!("head {}", key);
        let size = self.store.head(key).await?;
        let mut state = self.state();
        match size {
            Some(size) => {
                state.exists.insert(key.to_string(), true);
                state.sizes.insert(key.to_string(), size);
            }
            None => {
                state.exists.insert(key.to_string(), false);
            }
        }
        Ok(size)
    }
}

#[async_trait]
impl RepoFs for BucketFs {
    async fn read(&self, path: &str) -> Result<Bytes> {
        let key = self.key(path);

        {
            let state = self.state();
            match state.contents.get(&key) {
                Some(Lookup::Found(data)) => return Ok(data.clone()),
                Some(Lookup::Absent) => return Err(Error::NotFound(path.to_string())),
                None => {}
            }
        }

        if let Some(data) = self.cache.get(&key) {
            self.state().remember(&key, &data);
            return Ok(data);
        }

        if self.state().known_absent(&key) {
            return Err(Error::NotFound(path.to_string()));
        }

        trace!("get {}", key);
        match self.store.get(&key).await? {
            Some(data) => {
                self.state().remember(&key, &data);
                self.cache.put(&key, data.clone(), self.class(&key));
                Ok(data)
            }
            None => {
                self.state().remember_absent(&key);
                Err(Error::NotFound(path.to_string()))
            }
        }
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let key = self.key(path);
        let data = Bytes::copy_from_slice(data);

        trace!("put {} ({} bytes)", key, data.len());
        self.store.put(&key, data.clone()).await?;

        self.state().note_written(&key, &data);
        self.cache.note_write(&key, &data, self.class(&key));
        Ok(())
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        let key = self.key(path);

        trace!("delete {}", key);
        self.store.delete(&key).await?;

        self.state().note_deleted(&key);
        self.cache.note_delete(&key);
        Ok(())
    }

    async fn readdir(&self, path: &str) -> Result<Vec<String>> {
        let dir = dir_prefix(&self.key(path));
        let keys = self.keys_with_prefix(&dir).await?;

        let mut names: BTreeSet<String> = keys
            .iter()
            .filter_map(|key| child_name(&dir, key))
            .map(str::to_string)
            .collect();

        let state = self.state();
        names.extend(
            state
                .dir_markers
                .iter()
                .filter_map(|marker| child_name(&dir, marker))
                .map(str::to_string),
        );

        Ok(names.into_iter().collect())
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let key = self.key(path);
        self.state().dir_markers.insert(key);
        Ok(())
    }

    async fn rmdir(&self, path: &str, recursive: bool) -> Result<()> {
        let key = self.key(path);
        let dir = dir_prefix(&key);

        if recursive {
            let keys = self.store.list(&dir).await?;
            debug!("removing {} keys under {}", keys.len(), dir);
            for child in &keys {
                self.store.delete(child).await?;
                self.state().note_deleted(child);
                self.cache.note_delete(child);
            }
            self.state().dir_markers.retain(|marker| !marker.starts_with(&dir));
        }

        self.state().dir_markers.remove(&key);
        Ok(())
    }

    async fn stat(&self, path: &str) -> Result<Metadata> {
        let key = self.key(path);

        {
            let state = self.state();
            if state.dir_markers.contains(&key) {
                return Ok(Metadata::directory());
            }
            if let Some(Lookup::Found(data)) = state.contents.get(&key) {
                return Ok(Metadata::file(data.len() as u64));
            }
            if let Some(size) = state.sizes.get(&key) {
                return Ok(Metadata::file(*size));
            }
        }

        // One listing of `key` answers both "is it a file" and "is anything
        // below it".
        let keys = self.keys_with_prefix(&key).await?;

        if keys.contains(&key) {
            if let Some(size) = self.size_of(&key).await? {
                return Ok(Metadata::file(size));
            }
        }

        let below = dir_prefix(&key);
        if keys.iter().any(|k| k.starts_with(&below)) {
            return Ok(Metadata::directory());
        }

        self.state().exists.insert(key, false);
        Err(Error::NotFound(path.to_string()))
    }

    async fn batch_get(&self, paths: &[String]) -> Result<HashMap<String, Bytes>> {
        let mut found = HashMap::with_capacity(paths.len());
        let mut wanted: Vec<(String, String)> = Vec::new();

        for path in paths {
            let key = self.key(path);
            {
                let state = self.state();
                match state.contents.get(&key) {
                    Some(Lookup::Found(data)) => {
                        found.insert(path.clone(), data.clone());
                        continue;
                    }
                    Some(Lookup::Absent) => continue,
                    None => {}
                }
            }
            if let Some(data) = self.cache.get(&key) {
                self.state().remember(&key, &data);
                found.insert(path.clone(), data);
                continue;
            }
            if self.state().known_absent(&key) {
                continue;
            }
            wanted.push((path.clone(), key));
        }

        if wanted.is_empty() {
            return Ok(found);
        }

        let keys: Vec<String> = wanted.iter().map(|(_, key)| key.clone()).collect();
        trace!("batch get {} keys under {}", keys.len(), self.prefix);
        let mut fetched = self.store.get_many(&keys).await?;

        for (path, key) in wanted {
            match fetched.remove(&key) {
                Some(data) => {
                    self.state().remember(&key, &data);
                    self.cache.put(&key, data.clone(), self.class(&key));
                    found.insert(path, data);
                }
                None => self.state().remember_absent(&key),
            }
        }

        Ok(found)
    }

    fn invalidate(&self, path: &str) {
        let key = self.key(path);
        {
            let mut state = self.state();
            state.contents.remove(&key);
            state.exists.remove(&key);
            state.sizes.remove(&key);
            state.stale.insert(key.clone());
        }
        self.cache.invalidate(&key);
    }
}
