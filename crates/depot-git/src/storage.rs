//! Bare-repository object and ref storage over a [`RepoFs`]
//!
//! Layout, relative to the repository's storage prefix:
//!   HEAD                  -> "ref: refs/heads/main\n"
//!   config, description   -> written once by [`GitStorage::init`]
//!   refs/heads/main       -> "<commit-sha1>\n"
//!   refs/tags/v1.0        -> "<tag-sha1>\n"
//!   packed-refs           -> optional, read as a fallback
//!   objects/ab/cdef...    -> zlib-compressed loose object
//!
//! Every operation goes through the filesystem adapter, so the same code
//! runs against any object store backend.

use depot_store::RepoFs;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::object::{GitObject, ObjectId, ObjectType};
use crate::refs::{parse_packed_refs, validate_ref_name, NamedRef, Ref, HEAD};
use crate::{Error, Result};

/// `HEAD` of a freshly created repository
pub const INITIAL_HEAD: &str = "ref: refs/heads/main\n";
/// `config` of a freshly created repository
pub const INITIAL_CONFIG: &str =
    "[core]\n\trepositoryformatversion = 0\n\tfilemode = true\n\tbare = true\n";
/// `description` of a freshly created repository
pub const INITIAL_DESCRIPTION: &str =
    "Unnamed repository; edit this file 'description' to name the repository.\n";

const PACKED_REFS: &str = "packed-refs";

/// Git object and ref storage for one repository
#[derive(Clone)]
pub struct GitStorage {
    fs: Arc<dyn RepoFs>,
}

impl GitStorage {
    pub fn new(fs: Arc<dyn RepoFs>) -> Self {
        Self { fs }
    }

    /// The filesystem this storage runs on
    pub fn fs(&self) -> &Arc<dyn RepoFs> {
        &self.fs
    }

    /// Write the bootstrap files of an empty bare repository.
    pub async fn init(&self) -> Result<()> {
        self.fs.write(HEAD, INITIAL_HEAD.as_bytes()).await?;
        self.fs.write("config", INITIAL_CONFIG.as_bytes()).await?;
        self.fs.write("description", INITIAL_DESCRIPTION.as_bytes()).await?;
        debug!("initialized bare repository");
        Ok(())
    }

    /// Whether the repository has been initialized (has a `HEAD`).
    pub async fn exists(&self) -> Result<bool> {
        match self.fs.read(HEAD).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every key of the repository.
    pub async fn destroy(&self) -> Result<()> {
        self.fs.rmdir("", true).await?;
        Ok(())
    }

    // === Object operations ===

    /// Check if an object exists
    pub async fn has_object(&self, oid: &ObjectId) -> Result<bool> {
        match self.fs.read(&oid.loose_path()).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Read an object by ID
    pub async fn read_object(&self, oid: &ObjectId) -> Result<GitObject> {
        let compressed = self.fs.read(&oid.loose_path()).await.map_err(|e| {
            if e.is_not_found() {
                Error::ObjectNotFound(oid.to_hex())
            } else {
                e.into()
            }
        })?;
        decode_loose(&compressed)
    }

    /// Read many objects with one batched fetch. Missing objects are left
    /// out of the result.
    pub async fn read_objects(&self, oids: &[ObjectId]) -> Result<HashMap<ObjectId, GitObject>> {
        let paths: Vec<String> = oids.iter().map(ObjectId::loose_path).collect();
        let mut found = self.fs.batch_get(&paths).await?;

        let mut objects = HashMap::with_capacity(found.len());
        for (oid, path) in oids.iter().zip(&paths) {
            if let Some(compressed) = found.remove(path) {
                objects.insert(*oid, decode_loose(&compressed)?);
            }
        }
        Ok(objects)
    }

    /// Write an object, returning its ID
    pub async fn write_object(&self, obj: &GitObject) -> Result<ObjectId> {
        let oid = obj.id();

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&obj.to_loose_format())?;
        let compressed = encoder.finish()?;

        self.fs.write(&oid.loose_path(), &compressed).await?;
        Ok(oid)
    }

    /// Write a blob, returning its ID
    pub async fn write_blob(&self, content: &[u8]) -> Result<ObjectId> {
        self.write_object(&GitObject::new(ObjectType::Blob, content.to_vec()))
            .await
    }

    /// Write a tree, returning its ID
    pub async fn write_tree(&self, content: &[u8]) -> Result<ObjectId> {
        self.write_object(&GitObject::new(ObjectType::Tree, content.to_vec()))
            .await
    }

    /// Write a commit, returning its ID
    pub async fn write_commit(&self, content: &[u8]) -> Result<ObjectId> {
        self.write_object(&GitObject::new(ObjectType::Commit, content.to_vec()))
            .await
    }

    /// Write a tag, returning its ID
    pub async fn write_tag(&self, content: &[u8]) -> Result<ObjectId> {
        self.write_object(&GitObject::new(ObjectType::Tag, content.to_vec()))
            .await
    }

    // === Ref operations ===

    /// Read a ref, falling back to `packed-refs`
    pub async fn read_ref(&self, name: &str) -> Result<Ref> {
        validate_ref_name(name)?;

        match self.fs.read_to_string(name).await {
            Ok(value) => Ref::parse(&value),
            Err(e) if e.is_not_found() => self
                .packed_refs()
                .await?
                .remove(name)
                .map(Ref::Direct)
                .ok_or_else(|| Error::RefNotFound(name.into())),
            Err(e) => Err(e.into()),
        }
    }

    /// Write a ref
    pub async fn write_ref(&self, name: &str, target: &Ref) -> Result<()> {
        validate_ref_name(name)?;
        self.fs
            .write(name, target.to_file_content().as_bytes())
            .await?;
        Ok(())
    }

    /// Delete a ref. Returns whether it existed.
    pub async fn delete_ref(&self, name: &str) -> Result<bool> {
        validate_ref_name(name)?;

        let loose = match self.fs.read(name).await {
            Ok(_) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e.into()),
        };
        if loose {
            self.fs.unlink(name).await?;
        }
        let packed = self.remove_packed_ref(name).await?;
        Ok(loose || packed)
    }

    /// Resolve a ref to its final object ID (follows symbolic refs)
    pub async fn resolve_ref(&self, name: &str) -> Result<ObjectId> {
        const MAX_DEPTH: usize = 10;
        let mut current = name.to_string();

        for _ in 0..MAX_DEPTH {
            match self.read_ref(&current).await? {
                Ref::Direct(oid) => return Ok(oid),
                Ref::Symbolic(target) => current = target,
            }
        }

        Err(Error::RefNotFound(format!(
            "symbolic ref loop or too deep: {}",
            name
        )))
    }

    /// Target of a symbolic `HEAD`, e.g. `refs/heads/main`
    pub async fn head_target(&self) -> Result<Option<String>> {
        match self.read_ref(HEAD).await {
            Ok(Ref::Symbolic(target)) => Ok(Some(target)),
            Ok(Ref::Direct(_)) => Ok(None),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// All refs under `refs/`, sorted by name
    pub async fn list_refs(&self) -> Result<Vec<NamedRef>> {
        self.list_refs_with_prefix("refs/").await
    }

    /// Refs whose full name starts with `prefix` (e.g. "refs/heads/"), sorted
    pub async fn list_refs_with_prefix(&self, prefix: &str) -> Result<Vec<NamedRef>> {
        let mut leaves = Vec::new();
        self.collect_ref_paths("refs", &mut leaves).await?;
        leaves.retain(|name| name.starts_with(prefix));

        let mut found = self.fs.batch_get(&leaves).await?;
        let mut refs: BTreeMap<String, Ref> = BTreeMap::new();

        for name in leaves {
            let Some(data) = found.remove(&name) else {
                continue;
            };
            match Ref::parse(&String::from_utf8_lossy(&data)) {
                Ok(reference) => {
                    refs.insert(name, reference);
                }
                Err(e) => warn!("skipping unreadable ref {}: {}", name, e),
            }
        }

        for (name, oid) in self.packed_refs().await? {
            if name.starts_with(prefix) {
                refs.entry(name).or_insert(Ref::Direct(oid));
            }
        }

        Ok(refs
            .into_iter()
            .map(|(name, reference)| NamedRef::new(name, reference))
            .collect())
    }

    /// Update a ref only if it still holds `expected` (`None` = absent).
    /// `new_value` of `None` deletes the ref. Returns false on mismatch.
    ///
    /// The check and the write are not atomic against the store; callers
    /// serialize updates per repository.
    pub async fn compare_and_swap_ref(
        &self,
        name: &str,
        expected: Option<&ObjectId>,
        new_value: Option<&ObjectId>,
    ) -> Result<bool> {
        validate_ref_name(name)?;

        self.fs.invalidate(name);
        self.fs.invalidate(PACKED_REFS);

        let current = match self.read_ref(name).await {
            Ok(Ref::Direct(oid)) => Some(oid),
            Ok(Ref::Symbolic(_)) => {
                return Err(Error::InvalidRefName(format!("{} is a symbolic ref", name)))
            }
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        if current.as_ref() != expected {
            debug!(
                "ref {} moved: expected {:?}, found {:?}",
                name, expected, current
            );
            return Ok(false);
        }

        match new_value {
            Some(oid) => self.write_ref(name, &Ref::Direct(*oid)).await?,
            None => {
                self.delete_ref(name).await?;
            }
        }

        Ok(true)
    }

    async fn collect_ref_paths(&self, dir: &str, out: &mut Vec<String>) -> Result<()> {
        let mut pending = vec![dir.to_string()];

        while let Some(dir) = pending.pop() {
            for child in self.fs.readdir(&dir).await? {
                let path = format!("{}/{}", dir, child);
                // A ref path is either a file or a directory, never both
                if self.fs.readdir(&path).await?.is_empty() {
                    out.push(path);
                } else {
                    pending.push(path);
                }
            }
        }

        out.sort();
        Ok(())
    }

    async fn packed_refs(&self) -> Result<BTreeMap<String, ObjectId>> {
        match self.fs.read_to_string(PACKED_REFS).await {
            Ok(content) => Ok(parse_packed_refs(&content)),
            Err(e) if e.is_not_found() => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop one ref from `packed-refs`, keeping everything else as written.
    async fn remove_packed_ref(&self, name: &str) -> Result<bool> {
        let content = match self.fs.read_to_string(PACKED_REFS).await {
            Ok(content) => content,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let mut removed = false;
        let mut kept = String::with_capacity(content.len());
        let mut skip_peeled = false;
        for line in content.lines() {
            if line.starts_with('^') {
                if !skip_peeled {
                    kept.push_str(line);
                    kept.push('\n');
                }
                continue;
            }
            skip_peeled = line.split_once(' ').map(|(_, n)| n.trim()) == Some(name);
            if skip_peeled {
                removed = true;
            } else {
                kept.push_str(line);
                kept.push('\n');
            }
        }

        if removed {
            self.fs.write(PACKED_REFS, kept.as_bytes()).await?;
        }
        Ok(removed)
    }
}

fn decode_loose(compressed: &[u8]) -> Result<GitObject> {
    let mut decoder = ZlibDecoder::new(compressed);
    let mut data = Vec::new();
    decoder.read_to_end(&mut data)?;
    GitObject::from_loose_format(&data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_store::{BucketFs, CachePolicy, MemoryObjectStore, ObjectStore, SharedCache};

    const PREFIX: &str = "repos/1/demo.git";

    fn storage_over(store: &Arc<MemoryObjectStore>) -> GitStorage {
        let cache = Arc::new(SharedCache::new(CachePolicy::default()));
        GitStorage::new(Arc::new(BucketFs::new(store.clone(), cache, PREFIX)))
    }

    #[tokio::test]
    async fn test_init_writes_exact_bootstrap_files() -> Result<()> {
        let store = Arc::new(MemoryObjectStore::new());
        let storage = storage_over(&store);
        assert!(!storage.exists().await?);

        storage.init().await?;

        assert_eq!(
            store.keys(),
            vec![
                "repos/1/demo.git/HEAD".to_string(),
                "repos/1/demo.git/config".to_string(),
                "repos/1/demo.git/description".to_string(),
            ]
        );
        let read = |key: &'static str| {
            let store = store.clone();
            async move { store.get(key).await.map(|v| v.unwrap_or_default()) }
        };
        assert_eq!(&read("repos/1/demo.git/HEAD").await?[..], b"ref: refs/heads/main\n");
        assert_eq!(
            &read("repos/1/demo.git/config").await?[..],
            b"[core]\n\trepositoryformatversion = 0\n\tfilemode = true\n\tbare = true\n"
        );
        assert_eq!(
            &read("repos/1/demo.git/description").await?[..],
            b"Unnamed repository; edit this file 'description' to name the repository.\n"
        );
        assert!(storage.exists().await?);
        assert_eq!(storage.head_target().await?, Some("refs/heads/main".to_string()));
        assert!(storage.list_refs().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_object_roundtrip() -> Result<()> {
        let store = Arc::new(MemoryObjectStore::new());
        let storage = storage_over(&store);

        let oid = storage.write_blob(b"hello world\n").await?;
        assert_eq!(oid.to_hex(), "3b18e512dba79e4c8300dd08aeb37f8e728b8dad");
        assert!(store
            .keys()
            .contains(&"repos/1/demo.git/objects/3b/18e512dba79e4c8300dd08aeb37f8e728b8dad".to_string()));

        // Fresh adapter reads it back from the store
        let obj = storage_over(&store).read_object(&oid).await?;
        assert_eq!(obj.content, b"hello world\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_object() -> Result<()> {
        let storage = storage_over(&Arc::new(MemoryObjectStore::new()));
        let oid = ObjectId::hash_object(ObjectType::Blob, b"nope");
        assert!(!storage.has_object(&oid).await?);
        assert!(matches!(
            storage.read_object(&oid).await,
            Err(Error::ObjectNotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_read_objects_batches() -> Result<()> {
        let store = Arc::new(MemoryObjectStore::new());
        let writer = storage_over(&store);
        let a = writer.write_blob(b"a").await?;
        let b = writer.write_blob(b"b").await?;
        let missing = ObjectId::hash_object(ObjectType::Blob, b"c");

        // Separate cache so nothing is served from memory
        let reader = storage_over(&store);
        let before = store.stats().round_trips();
        let objects = reader.read_objects(&[a, b, missing]).await?;
        assert_eq!(store.stats().round_trips() - before, 1);
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[&b].content, b"b");
        Ok(())
    }

    #[tokio::test]
    async fn test_ref_operations() -> Result<()> {
        let store = Arc::new(MemoryObjectStore::new());
        let storage = storage_over(&store);
        storage.init().await?;

        let oid = storage.write_blob(b"test").await?;
        storage.write_ref("refs/heads/main", &Ref::Direct(oid)).await?;
        storage.write_ref("refs/heads/feature/x", &Ref::Direct(oid)).await?;
        storage.write_ref("refs/tags/v1", &Ref::Direct(oid)).await?;

        assert_eq!(storage.resolve_ref("HEAD").await?, oid);

        let fresh = storage_over(&store);
        let names: Vec<String> = fresh
            .list_refs()
            .await?
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(
            names,
            vec!["refs/heads/feature/x", "refs/heads/main", "refs/tags/v1"]
        );
        assert_eq!(fresh.list_refs_with_prefix("refs/tags/").await?.len(), 1);

        assert!(fresh.delete_ref("refs/heads/feature/x").await?);
        assert!(!fresh.delete_ref("refs/heads/feature/x").await?);
        assert!(matches!(
            fresh.read_ref("refs/heads/feature/x").await,
            Err(Error::RefNotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_packed_refs_fallback() -> Result<()> {
        let store = Arc::new(MemoryObjectStore::new());
        let storage = storage_over(&store);
        let oid = storage.write_blob(b"packed").await?;
        storage
            .fs()
            .write(
                "packed-refs",
                format!("# pack-refs with: peeled\n{} refs/heads/old\n", oid).as_bytes(),
            )
            .await?;

        assert_eq!(storage.resolve_ref("refs/heads/old").await?, oid);
        assert_eq!(storage.list_refs().await?.len(), 1);

        assert!(storage.delete_ref("refs/heads/old").await?);
        assert!(storage.read_ref("refs/heads/old").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_compare_and_swap() -> Result<()> {
        let store = Arc::new(MemoryObjectStore::new());
        let storage = storage_over(&store);
        let a = storage.write_blob(b"a").await?;
        let b = storage.write_blob(b"b").await?;

        assert!(storage.compare_and_swap_ref("refs/heads/main", None, Some(&a)).await?);
        assert!(!storage.compare_and_swap_ref("refs/heads/main", None, Some(&b)).await?);
        assert!(!storage.compare_and_swap_ref("refs/heads/main", Some(&b), Some(&b)).await?);
        assert!(storage.compare_and_swap_ref("refs/heads/main", Some(&a), Some(&b)).await?);
        assert_eq!(storage.resolve_ref("refs/heads/main").await?, b);

        // A concurrent writer through another adapter is noticed
        let other = storage_over(&store);
        assert!(other.compare_and_swap_ref("refs/heads/main", Some(&b), Some(&a)).await?);
        assert!(!storage.compare_and_swap_ref("refs/heads/main", Some(&b), None).await?);
        assert!(storage.compare_and_swap_ref("refs/heads/main", Some(&a), None).await?);
        assert!(storage.read_ref("refs/heads/main").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_destroy_removes_everything() -> Result<()> {
        let store = Arc::new(MemoryObjectStore::new());
        let storage = storage_over(&store);
        storage.init().await?;
        storage.write_blob(b"x").await?;
        store
            .put("repos/1/other.git/HEAD", bytes::Bytes::from_static(b"x"))
            .await?;

        storage.destroy().await?;
        assert_eq!(store.keys(), vec!["repos/1/other.git/HEAD".to_string()]);
        Ok(())
    }
}
