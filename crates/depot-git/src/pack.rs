//! Git packfile generation and parsing
//!
//! Packfiles are git's binary format for transferring objects.
//! Format: PACK header, N objects, SHA-1 checksum.
//!
//! Generated packs hold full (undeltified) objects. Received packs may use
//! `OFS_DELTA` and `REF_DELTA` entries; `REF_DELTA` bases missing from the
//! pack (thin packs) are read from storage.

use flate2::bufread::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha1::{Digest, Sha1};
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use tracing::debug;

use crate::object::{Commit, GitObject, ObjectId, ObjectType, Tag, parse_tree};
use crate::storage::GitStorage;
use crate::{Error, Result};

const OBJ_OFS_DELTA: u8 = 6;
const OBJ_REF_DELTA: u8 = 7;

/// Encode objects into a version 2 packfile, in the order given
pub fn encode_pack(objects: &[GitObject]) -> Result<Vec<u8>> {
    let mut pack = Vec::new();

    pack.extend_from_slice(b"PACK");
    pack.extend_from_slice(&2u32.to_be_bytes());
    pack.extend_from_slice(&(objects.len() as u32).to_be_bytes());

    for obj in objects {
        write_entry_header(&mut pack, obj.obj_type.pack_type(), obj.content.len());
        pack.extend_from_slice(&deflate(&obj.content)?);
    }

    let checksum = Sha1::digest(&pack);
    pack.extend_from_slice(&checksum);

    Ok(pack)
}

/// Generate a packfile containing the given objects
pub async fn generate_packfile(storage: &GitStorage, oids: &[ObjectId]) -> Result<Vec<u8>> {
    let mut found = storage.read_objects(oids).await?;

    let mut objects = Vec::with_capacity(oids.len());
    for oid in oids {
        let obj = found
            .remove(oid)
            .ok_or_else(|| Error::ObjectNotFound(oid.to_hex()))?;
        objects.push(obj);
    }

    encode_pack(&objects)
}

/// Type (3 bits) and size (varint) header of one pack entry
fn write_entry_header(pack: &mut Vec<u8>, type_bits: u8, size: usize) {
    let mut c = (type_bits << 4) | ((size & 0x0F) as u8);
    let mut remaining = size >> 4;

    if remaining > 0 {
        c |= 0x80;
    }
    pack.push(c);

    while remaining > 0 {
        let mut byte = (remaining & 0x7F) as u8;
        remaining >>= 7;
        if remaining > 0 {
            byte |= 0x80;
        }
        pack.push(byte);
    }
}

fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// How one pack entry's content is to be interpreted
#[derive(Debug, Clone, PartialEq, Eq)]
enum EntryKind {
    Base(ObjectType),
    /// Delta against the entry starting at this pack offset
    OfsDelta(usize),
    /// Delta against the object with this id
    RefDelta(ObjectId),
}

/// One inflated pack entry
#[derive(Debug)]
struct PackEntry {
    offset: usize,
    kind: EntryKind,
    data: Vec<u8>,
}

/// Parse a packfile, storing its objects and returning their IDs in pack
/// order. Objects only used as thin-pack bases are not rewritten.
pub async fn parse_packfile(storage: &GitStorage, data: &[u8]) -> Result<Vec<ObjectId>> {
    let entries = read_entries(data)?;
    let objects = resolve_entries(storage, entries).await?;

    let mut oids = Vec::with_capacity(objects.len());
    for obj in &objects {
        oids.push(storage.write_object(obj).await?);
    }

    debug!("unpacked {} objects", oids.len());
    Ok(oids)
}

/// Verify header and checksum, then inflate every entry.
fn read_entries(data: &[u8]) -> Result<Vec<PackEntry>> {
    if data.len() < 32 {
        return Err(Error::PackError("packfile too small".into()));
    }

    if &data[0..4] != b"PACK" {
        return Err(Error::PackError("invalid packfile magic".into()));
    }

    let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if version != 2 && version != 3 {
        return Err(Error::PackError(format!("unsupported pack version: {}", version)));
    }

    let object_count = u32::from_be_bytes([data[8], data[9], data[10], data[11]]) as usize;

    let checksum_start = data.len() - 20;
    let computed = Sha1::digest(&data[..checksum_start]);
    if computed[..] != data[checksum_start..] {
        return Err(Error::PackError("checksum mismatch".into()));
    }

    let body = &data[..checksum_start];
    let mut pos = 12;
    // Every entry takes at least two bytes, so the header count cannot
    // size the list beyond what the body can hold
    let mut entries = Vec::with_capacity(object_count.min((checksum_start - pos) / 2));

    for _ in 0..object_count {
        let (entry, next) = read_entry(body, pos)?;
        entries.push(entry);
        pos = next;
    }

    if pos != checksum_start {
        return Err(Error::PackError(format!(
            "{} trailing bytes after last object",
            checksum_start - pos
        )));
    }

    Ok(entries)
}

/// Read the entry starting at `offset`; returns it and the next offset.
fn read_entry(body: &[u8], offset: usize) -> Result<(PackEntry, usize)> {
    let truncated = || Error::PackError(format!("truncated entry at offset {}", offset));
    let mut pos = offset;

    let first = *body.get(pos).ok_or_else(truncated)?;
    pos += 1;

    let type_bits = (first >> 4) & 0x07;
    let mut size = (first & 0x0F) as usize;
    let mut shift = 4;
    let mut byte = first;
    while byte & 0x80 != 0 {
        if shift > 57 {
            return Err(Error::PackError(format!("entry size overflow at offset {}", offset)));
        }
        byte = *body.get(pos).ok_or_else(truncated)?;
        pos += 1;
        size |= ((byte & 0x7F) as usize) << shift;
        shift += 7;
    }

    let kind = match type_bits {
        OBJ_OFS_DELTA => {
            let mut c = *body.get(pos).ok_or_else(truncated)?;
            pos += 1;
            let mut distance = (c & 0x7F) as usize;
            while c & 0x80 != 0 {
                c = *body.get(pos).ok_or_else(truncated)?;
                pos += 1;
                distance = ((distance + 1) << 7) | (c & 0x7F) as usize;
            }
            let base = offset.checked_sub(distance).filter(|_| distance > 0).ok_or_else(|| {
                Error::PackError(format!("bad delta base distance at offset {}", offset))
            })?;
            EntryKind::OfsDelta(base)
        }
        OBJ_REF_DELTA => {
            let oid = body
                .get(pos..pos + 20)
                .and_then(ObjectId::from_bytes)
                .ok_or_else(truncated)?;
            pos += 20;
            EntryKind::RefDelta(oid)
        }
        other => EntryKind::Base(
            ObjectType::from_pack_type(other)
                .ok_or_else(|| Error::PackError(format!("unsupported object type: {}", other)))?,
        ),
    };

    let mut decoder = ZlibDecoder::new(&body[pos..]);
    let mut data = Vec::with_capacity(size.min(body.len() - pos));
    (&mut decoder)
        .take(size as u64 + 1)
        .read_to_end(&mut data)
        .map_err(|e| Error::PackError(format!("inflate at offset {}: {}", offset, e)))?;
    if data.len() != size {
        return Err(Error::PackError(format!(
            "size mismatch at offset {}: expected {}, got {}",
            offset,
            size,
            data.len()
        )));
    }
    pos += decoder.total_in() as usize;

    Ok((PackEntry { offset, kind, data }, pos))
}

/// Turn entries into full objects, resolving delta chains. Passes repeat
/// until nothing is left; when a pass makes no progress the missing
/// `REF_DELTA` bases are fetched from storage.
async fn resolve_entries(storage: &GitStorage, entries: Vec<PackEntry>) -> Result<Vec<GitObject>> {
    let mut resolved: Vec<Option<GitObject>> = vec![None; entries.len()];
    let index_of: HashMap<usize, usize> = entries
        .iter()
        .enumerate()
        .map(|(i, e)| (e.offset, i))
        .collect();
    let mut by_oid: HashMap<ObjectId, usize> = HashMap::new();
    let mut external: HashMap<ObjectId, GitObject> = HashMap::new();

    let mut pending: Vec<usize> = (0..entries.len()).collect();

    while !pending.is_empty() {
        let mut still_pending = Vec::new();

        for &i in &pending {
            let entry = &entries[i];
            let object = match &entry.kind {
                EntryKind::Base(obj_type) => Some(GitObject::new(*obj_type, entry.data.clone())),
                EntryKind::OfsDelta(base_offset) => {
                    let base_index = index_of.get(base_offset).ok_or_else(|| {
                        Error::PackError(format!("no entry at delta base offset {}", base_offset))
                    })?;
                    match &resolved[*base_index] {
                        Some(base) => Some(apply_delta_object(base, &entry.data)?),
                        None => None,
                    }
                }
                EntryKind::RefDelta(base_oid) => {
                    let base = by_oid
                        .get(base_oid)
                        .and_then(|&bi| resolved[bi].as_ref())
                        .or_else(|| external.get(base_oid));
                    match base {
                        Some(base) => Some(apply_delta_object(base, &entry.data)?),
                        None => None,
                    }
                }
            };

            match object {
                Some(obj) => {
                    by_oid.insert(obj.id(), i);
                    resolved[i] = Some(obj);
                }
                None => still_pending.push(i),
            }
        }

        if still_pending.len() == pending.len() {
            let missing: Vec<ObjectId> = still_pending
                .iter()
                .filter_map(|&i| match &entries[i].kind {
                    EntryKind::RefDelta(oid) if !by_oid.contains_key(oid) => Some(*oid),
                    _ => None,
                })
                .filter(|oid| !external.contains_key(oid))
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();

            if missing.is_empty() {
                return Err(Error::PackError("delta chain cannot be resolved".into()));
            }

            let fetched = storage.read_objects(&missing).await?;
            if fetched.is_empty() {
                return Err(Error::PackError(format!(
                    "missing delta base {}",
                    missing[0]
                )));
            }
            debug!("resolved {} thin-pack bases from storage", fetched.len());
            external.extend(fetched);
        }

        pending = still_pending;
    }

    Ok(resolved.into_iter().flatten().collect())
}

fn apply_delta_object(base: &GitObject, delta: &[u8]) -> Result<GitObject> {
    Ok(GitObject::new(base.obj_type, apply_delta(&base.content, delta)?))
}

/// Apply a git delta (copy/insert instructions) to `base`
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let (src_size, mut pos) = read_size(delta, 0)?;
    let (dst_size, next) = read_size(delta, pos)?;
    pos = next;

    if src_size != base.len() {
        return Err(Error::PackError(format!(
            "delta base size mismatch: expected {}, got {}",
            src_size,
            base.len()
        )));
    }

    let truncated = || Error::PackError("truncated delta".into());
    let mut out = Vec::with_capacity(dst_size.min(base.len() + delta.len()));

    while pos < delta.len() {
        let op = delta[pos];
        pos += 1;

        if op & 0x80 != 0 {
            let mut offset = 0usize;
            let mut size = 0usize;
            for i in 0..4 {
                if op & (1 << i) != 0 {
                    offset |= (*delta.get(pos).ok_or_else(truncated)? as usize) << (8 * i);
                    pos += 1;
                }
            }
            for i in 0..3 {
                if op & (0x10 << i) != 0 {
                    size |= (*delta.get(pos).ok_or_else(truncated)? as usize) << (8 * i);
                    pos += 1;
                }
            }
            if size == 0 {
                size = 0x10000;
            }
            let chunk = base
                .get(offset..offset + size)
                .ok_or_else(|| Error::PackError("delta copy out of range".into()))?;
            out.extend_from_slice(chunk);
        } else if op != 0 {
            let len = op as usize;
            let chunk = delta.get(pos..pos + len).ok_or_else(truncated)?;
            out.extend_from_slice(chunk);
            pos += len;
        } else {
            return Err(Error::PackError("reserved delta opcode 0".into()));
        }

        if out.len() > dst_size {
            return Err(Error::PackError(format!(
                "delta result exceeds declared size {}",
                dst_size
            )));
        }
    }

    if out.len() != dst_size {
        return Err(Error::PackError(format!(
            "delta result size mismatch: expected {}, got {}",
            dst_size,
            out.len()
        )));
    }

    Ok(out)
}

/// Little-endian base-128 size used in delta headers
fn read_size(data: &[u8], mut pos: usize) -> Result<(usize, usize)> {
    let mut size = 0usize;
    let mut shift = 0;
    loop {
        let byte = *data
            .get(pos)
            .ok_or_else(|| Error::PackError("truncated delta header".into()))?;
        pos += 1;
        if shift > 63 {
            return Err(Error::PackError("delta header size overflow".into()));
        }
        size |= ((byte & 0x7F) as usize) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok((size, pos));
        }
    }
}

/// Packfile generation for upload-pack.
///
/// Collects everything reachable from the wants, minus the commits
/// reachable from the haves and the trees and blobs of the have commits
/// themselves. The walk goes level by level with one batched read per level.
pub struct PackBuilder<'a> {
    storage: &'a GitStorage,
    want: Vec<ObjectId>,
    have: Vec<ObjectId>,
}

impl<'a> PackBuilder<'a> {
    pub fn new(storage: &'a GitStorage) -> Self {
        Self {
            storage,
            want: Vec::new(),
            have: Vec::new(),
        }
    }

    pub fn want(&mut self, oid: ObjectId) {
        self.want.push(oid);
    }

    pub fn have(&mut self, oid: ObjectId) {
        self.have.push(oid);
    }

    /// Ids of the objects the pack will hold: commits, tags, trees, blobs
    pub async fn object_ids(&self) -> Result<Vec<ObjectId>> {
        let mut seen = self.common_objects().await?;

        let mut commits = Vec::new();
        let mut tags = Vec::new();
        let mut trees = Vec::new();
        let mut blobs = Vec::new();

        let mut frontier: Vec<ObjectId> = self
            .want
            .iter()
            .copied()
            .filter(|oid| seen.insert(*oid))
            .collect();

        while !frontier.is_empty() {
            let objects = self.storage.read_objects(&frontier).await?;
            let mut next = Vec::new();

            for oid in frontier {
                let obj = objects
                    .get(&oid)
                    .ok_or_else(|| Error::ObjectNotFound(oid.to_hex()))?;

                match obj.obj_type {
                    ObjectType::Commit => {
                        commits.push(oid);
                        let commit = Commit::parse(&obj.content)?;
                        next.extend(
                            std::iter::once(commit.tree)
                                .chain(commit.parents)
                                .filter(|id| seen.insert(*id)),
                        );
                    }
                    ObjectType::Tree => {
                        trees.push(oid);
                        for entry in parse_tree(&obj.content)? {
                            if entry.is_gitlink() || !seen.insert(entry.oid) {
                                continue;
                            }
                            if entry.is_tree() {
                                next.push(entry.oid);
                            } else {
                                blobs.push(entry.oid);
                            }
                        }
                    }
                    ObjectType::Tag => {
                        tags.push(oid);
                        let target = Tag::parse(&obj.content)?.object;
                        if seen.insert(target) {
                            next.push(target);
                        }
                    }
                    ObjectType::Blob => blobs.push(oid),
                }
            }

            frontier = next;
        }

        let mut oids = commits;
        oids.extend(tags);
        oids.extend(trees);
        oids.extend(blobs);
        Ok(oids)
    }

    /// Build the packfile
    pub async fn build(self) -> Result<Vec<u8>> {
        let oids = self.object_ids().await?;
        debug!(
            "packing {} objects for {} wants / {} haves",
            oids.len(),
            self.want.len(),
            self.have.len()
        );
        generate_packfile(self.storage, &oids).await
    }

    /// Objects the client is known to have. Unknown haves are ignored.
    async fn common_objects(&self) -> Result<HashSet<ObjectId>> {
        let mut common = HashSet::new();
        if self.have.is_empty() {
            return Ok(common);
        }

        let mut tip_trees = Vec::new();
        let mut frontier: Vec<ObjectId> = self.have.clone();
        let mut first_level = true;

        while !frontier.is_empty() {
            let objects = self.storage.read_objects(&frontier).await?;
            let mut next = Vec::new();
            for oid in frontier {
                let Some(obj) = objects.get(&oid) else {
                    continue;
                };
                if obj.obj_type != ObjectType::Commit || !common.insert(oid) {
                    continue;
                }
                let commit = Commit::parse(&obj.content)?;
                if first_level {
                    tip_trees.push(commit.tree);
                }
                next.extend(commit.parents.into_iter().filter(|p| !common.contains(p)));
            }
            frontier = next;
            first_level = false;
        }

        let mut frontier = tip_trees;
        while !frontier.is_empty() {
            let objects = self.storage.read_objects(&frontier).await?;
            let mut next = Vec::new();
            for oid in frontier {
                let Some(obj) = objects.get(&oid) else {
                    continue;
                };
                if !common.insert(oid) {
                    continue;
                }
                for entry in parse_tree(&obj.content)? {
                    if entry.is_gitlink() {
                        continue;
                    }
                    if entry.is_tree() {
                        if !common.contains(&entry.oid) {
                            next.push(entry.oid);
                        }
                    } else {
                        common.insert(entry.oid);
                    }
                }
            }
            frontier = next;
        }

        Ok(common)
    }
}
