//! Read-side queries used outside the wire protocol: branches, commit log,
//! file contents at a ref.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use tracing::debug;

use crate::object::{parse_tree, Commit, ObjectId, ObjectType, Tag};
use crate::refs::{branch_name, branch_ref, tag_ref, Ref, HEAD, REFS_HEADS};
use crate::storage::GitStorage;
use crate::{Error, Result};

const MAX_PEEL_DEPTH: usize = 10;

/// A branch and the commit it points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    /// Short name, e.g. `main`
    pub name: String,
    pub oid: ObjectId,
    /// Whether `HEAD` points at this branch
    pub is_head: bool,
}

/// One commit of a log walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub oid: ObjectId,
    pub commit: Commit,
}

/// All branches, sorted by name
pub async fn list_branches(storage: &GitStorage) -> Result<Vec<Branch>> {
    let head = storage.head_target().await?;
    let mut branches = Vec::new();

    for named in storage.list_refs_with_prefix(REFS_HEADS).await? {
        let oid = match named.reference {
            Ref::Direct(oid) => oid,
            Ref::Symbolic(_) => match storage.resolve_ref(&named.name).await {
                Ok(oid) => oid,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            },
        };
        let Some(name) = branch_name(&named.name) else {
            continue;
        };
        branches.push(Branch {
            name: name.to_string(),
            oid,
            is_head: head.as_deref() == Some(named.name.as_str()),
        });
    }

    Ok(branches)
}

/// Resolve a branch name, full ref name, tag name or hex object id to a
/// commit. Annotated tags are peeled.
pub async fn resolve_commitish(storage: &GitStorage, spec: &str) -> Result<ObjectId> {
    let oid = resolve_name(storage, spec).await?;
    peel_to_commit(storage, oid).await
}

async fn resolve_name(storage: &GitStorage, spec: &str) -> Result<ObjectId> {
    if let Some(oid) = ObjectId::from_hex(spec) {
        if storage.has_object(&oid).await? {
            return Ok(oid);
        }
    }

    let mut candidates = Vec::new();
    if spec == HEAD || spec.starts_with("refs/") {
        candidates.push(spec.to_string());
    }
    candidates.push(branch_ref(spec));
    candidates.push(tag_ref(spec));

    for name in candidates {
        match storage.resolve_ref(&name).await {
            Ok(oid) => return Ok(oid),
            // Names that are not valid refs simply do not match
            Err(e) if e.is_not_found() || matches!(e, Error::InvalidRefName(_)) => continue,
            Err(e) => return Err(e),
        }
    }

    Err(Error::RefNotFound(spec.to_string()))
}

async fn peel_to_commit(storage: &GitStorage, mut oid: ObjectId) -> Result<ObjectId> {
    for _ in 0..MAX_PEEL_DEPTH {
        let obj = storage.read_object(&oid).await?;
        match obj.obj_type {
            ObjectType::Commit => return Ok(oid),
            ObjectType::Tag => oid = Tag::parse(&obj.content)?.object,
            other => {
                return Err(Error::InvalidObjectType(format!(
                    "{} is a {}, not a commit",
                    oid, other
                )))
            }
        }
    }
    Err(Error::InvalidObjectFormat(format!("tag chain too deep at {}", oid)))
}

/// Up to `limit` commits reachable from `start`, newest committer time
/// first. A commit is always listed before its parents.
pub async fn log(storage: &GitStorage, start: ObjectId, limit: usize) -> Result<Vec<LogEntry>> {
    let mut entries = Vec::new();
    if limit == 0 {
        return Ok(entries);
    }

    let first = Commit::parse(&storage.read_object(&start).await?.content)?;

    // (committer time, insertion order) so equal times pop child first
    let mut queue = BinaryHeap::new();
    let mut pending: HashMap<ObjectId, Commit> = HashMap::new();
    let mut seen = HashSet::from([start]);
    let mut seq = 0u64;
    queue.push((first.committer.time, Reverse(seq), start));
    pending.insert(start, first);

    while let Some((_, _, oid)) = queue.pop() {
        let Some(commit) = pending.remove(&oid) else {
            continue;
        };
        let parents: Vec<ObjectId> = commit
            .parents
            .iter()
            .copied()
            .filter(|p| seen.insert(*p))
            .collect();

        entries.push(LogEntry { oid, commit });
        if entries.len() >= limit {
            break;
        }

        if parents.is_empty() {
            continue;
        }
        let objects = storage.read_objects(&parents).await?;
        for parent in parents {
            let obj = objects
                .get(&parent)
                .ok_or_else(|| Error::ObjectNotFound(parent.to_hex()))?;
            let parsed = Commit::parse(&obj.content)?;
            seq += 1;
            queue.push((parsed.committer.time, Reverse(seq), parent));
            pending.insert(parent, parsed);
        }
    }

    debug!("log from {}: {} commits", start, entries.len());
    Ok(entries)
}

/// Content of the blob at `path` in the tree of `commitish`
pub async fn read_file_at(storage: &GitStorage, commitish: &str, path: &str) -> Result<Vec<u8>> {
    let commit_oid = resolve_commitish(storage, commitish).await?;
    let commit = Commit::parse(&storage.read_object(&commit_oid).await?.content)?;

    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    if components.is_empty() {
        return Err(Error::PathNotFound(path.to_string()));
    }

    let mut tree = commit.tree;
    for (i, component) in components.iter().enumerate() {
        let obj = storage.read_object(&tree).await?;
        let entry = parse_tree(&obj.content)?
            .into_iter()
            .find(|e| e.name == *component)
            .ok_or_else(|| Error::PathNotFound(path.to_string()))?;

        let last = i + 1 == components.len();
        match (last, entry.is_tree()) {
            (false, true) => tree = entry.oid,
            (true, false) if entry.is_blob() => {
                return Ok(storage.read_object(&entry.oid).await?.content)
            }
            _ => return Err(Error::PathNotFound(path.to_string())),
        }
    }

    Err(Error::PathNotFound(path.to_string()))
}
