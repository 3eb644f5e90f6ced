//! LMDB-backed object store for single-node deployments.

use async_trait::async_trait;
use bytes::Bytes;
use heed::types::{Bytes as RawBytes, Str};
use heed::{Database, EnvOpenOptions};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

use crate::store::ObjectStore;
use crate::Result;

/// LMDB-backed object store: one `key → value` database.
pub struct LmdbObjectStore {
    env: heed::Env,
    objects: Database<Str, RawBytes>,
}

impl LmdbObjectStore {
    /// Open or create an LMDB object store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_map_size(path, 10 * 1024 * 1024 * 1024) // 10GB default
    }

    /// Open or create with custom map size.
    pub fn with_map_size<P: AsRef<Path>>(path: P, map_size: usize) -> Result<Self> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(1)
                .open(path.as_ref())?
        };

        let mut wtxn = env.write_txn()?;
        let objects = env.create_database(&mut wtxn, Some("objects"))?;
        wtxn.commit()?;

        debug!("opened lmdb object store at {}", path.as_ref().display());
        Ok(Self { env, objects })
    }

    /// Number of stored keys.
    pub fn count(&self) -> Result<u64> {
        let rtxn = self.env.read_txn()?;
        Ok(self.objects.len(&rtxn)?)
    }

    fn get_sync(&self, key: &str) -> Result<Option<Bytes>> {
        let rtxn = self.env.read_txn()?;
        Ok(self
            .objects
            .get(&rtxn, key)?
            .map(Bytes::copy_from_slice))
    }

    fn put_sync(&self, key: &str, data: &[u8]) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.objects.put(&mut wtxn, key, data)?;
        wtxn.commit()?;
        Ok(())
    }

    fn delete_sync(&self, key: &str) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.objects.delete(&mut wtxn, key)?;
        wtxn.commit()?;
        Ok(())
    }

    fn list_sync(&self, prefix: &str) -> Result<Vec<String>> {
        let rtxn = self.env.read_txn()?;
        let mut keys = Vec::new();
        for item in self.objects.prefix_iter(&rtxn, prefix)? {
            let (key, _) = item?;
            keys.push(key.to_string());
        }
        Ok(keys)
    }
}

#[async_trait]
impl ObjectStore for LmdbObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.get_sync(key)
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.put_sync(key, &data)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.delete_sync(key)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.list_sync(prefix)
    }

    async fn head(&self, key: &str) -> Result<Option<u64>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.objects.get(&rtxn, key)?.map(|v| v.len() as u64))
    }

    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Bytes>> {
        let rtxn = self.env.read_txn()?;
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(data) = self.objects.get(&rtxn, key.as_str())? {
                found.insert(key.clone(), Bytes::copy_from_slice(data));
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get() -> Result<()> {
        let temp = TempDir::new()?;
        let store = LmdbObjectStore::new(temp.path().join("objects"))?;

        store.put("repos/1/a.git/HEAD", Bytes::from_static(b"ref: refs/heads/main\n")).await?;

        assert_eq!(
            store.get("repos/1/a.git/HEAD").await?,
            Some(Bytes::from_static(b"ref: refs/heads/main\n"))
        );
        assert_eq!(store.head("repos/1/a.git/HEAD").await?, Some(21));
        assert_eq!(store.get("repos/1/a.git/config").await?, None);

        Ok(())
    }

    #[tokio::test]
    async fn test_delete() -> Result<()> {
        let temp = TempDir::new()?;
        let store = LmdbObjectStore::new(temp.path().join("objects"))?;

        store.put("k", Bytes::from_static(b"delete me")).await?;
        store.delete("k").await?;
        assert_eq!(store.get("k").await?, None);
        store.delete("k").await?;

        Ok(())
    }

    #[tokio::test]
    async fn test_list_prefix() -> Result<()> {
        let temp = TempDir::new()?;
        let store = LmdbObjectStore::new(temp.path().join("objects"))?;

        for key in ["p/objects/ab/1", "p/objects/cd/2", "p/refs/heads/main", "q/HEAD"] {
            store.put(key, Bytes::from_static(b"x")).await?;
        }

        assert_eq!(store.list("p/objects/").await?, vec!["p/objects/ab/1", "p/objects/cd/2"]);
        assert_eq!(store.list("p/").await?.len(), 3);
        assert_eq!(store.count()?, 4);

        Ok(())
    }

    #[tokio::test]
    async fn test_get_many() -> Result<()> {
        let temp = TempDir::new()?;
        let store = LmdbObjectStore::new(temp.path().join("objects"))?;
        store.put("a", Bytes::from_static(b"1")).await?;
        store.put("b", Bytes::from_static(b"2")).await?;

        let found = store
            .get_many(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await?;
        assert_eq!(found.len(), 2);
        assert_eq!(found["b"], Bytes::from_static(b"2"));
        Ok(())
    }
}
