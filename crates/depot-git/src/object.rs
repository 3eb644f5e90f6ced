//! Git object types and serialization
//!
//! Git has four object types: blob, tree, commit, and tag.
//! Each is content-addressed by SHA-1 hash of: "{type} {size}\0{content}"

use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// The four git object types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Blob,
    Tree,
    Commit,
    Tag,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Blob => "blob",
            ObjectType::Tree => "tree",
            ObjectType::Commit => "commit",
            ObjectType::Tag => "tag",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "blob" => Some(ObjectType::Blob),
            "tree" => Some(ObjectType::Tree),
            "commit" => Some(ObjectType::Commit),
            "tag" => Some(ObjectType::Tag),
            _ => None,
        }
    }

    /// Type number used in packfile entry headers
    pub fn pack_type(&self) -> u8 {
        match self {
            ObjectType::Commit => 1,
            ObjectType::Tree => 2,
            ObjectType::Blob => 3,
            ObjectType::Tag => 4,
        }
    }

    pub fn from_pack_type(n: u8) -> Option<Self> {
        match n {
            1 => Some(ObjectType::Commit),
            2 => Some(ObjectType::Tree),
            3 => Some(ObjectType::Blob),
            4 => Some(ObjectType::Tag),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A 20-byte SHA-1 object ID
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 20]);

impl ObjectId {
    pub const ZERO: ObjectId = ObjectId([0u8; 20]);

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 20] = bytes.try_into().ok()?;
        Some(ObjectId(arr))
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 40 {
            return None;
        }
        let bytes = hex::decode(hex).ok()?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    /// Compute object ID from raw object data (type + content)
    pub fn hash_object(obj_type: ObjectType, content: &[u8]) -> Self {
        let header = format!("{} {}\0", obj_type.as_str(), content.len());
        let mut hasher = Sha1::new();
        hasher.update(header.as_bytes());
        hasher.update(content);
        ObjectId(hasher.finalize().into())
    }

    /// Repository-relative path of the loose object: `objects/xx/<38 hex>`
    pub fn loose_path(&self) -> String {
        let hex = self.to_hex();
        format!("objects/{}/{}", &hex[..2], &hex[2..])
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ObjectId::from_hex(s).ok_or_else(|| Error::InvalidObjectFormat(format!("bad object id: {}", s)))
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A git object with type and content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitObject {
    pub obj_type: ObjectType,
    pub content: Vec<u8>,
}

impl GitObject {
    pub fn new(obj_type: ObjectType, content: Vec<u8>) -> Self {
        Self { obj_type, content }
    }

    pub fn blob(content: Vec<u8>) -> Self {
        Self::new(ObjectType::Blob, content)
    }

    pub fn id(&self) -> ObjectId {
        ObjectId::hash_object(self.obj_type, &self.content)
    }

    /// Serialize to loose object format (before zlib)
    pub fn to_loose_format(&self) -> Vec<u8> {
        let header = format!("{} {}\0", self.obj_type.as_str(), self.content.len());
        let mut data = header.into_bytes();
        data.extend_from_slice(&self.content);
        data
    }

    /// Parse from loose object format (after zlib)
    pub fn from_loose_format(data: &[u8]) -> Result<Self> {
        let null_pos = data
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::InvalidObjectFormat("missing null byte".into()))?;

        let header = std::str::from_utf8(&data[..null_pos])
            .map_err(|_| Error::InvalidObjectFormat("invalid header".into()))?;

        let (type_str, size_str) = header
            .split_once(' ')
            .ok_or_else(|| Error::InvalidObjectFormat("missing size".into()))?;

        let obj_type =
            ObjectType::parse(type_str).ok_or_else(|| Error::InvalidObjectType(type_str.into()))?;
        let size: usize = size_str
            .parse()
            .map_err(|_| Error::InvalidObjectFormat("invalid size".into()))?;

        let content = data[null_pos + 1..].to_vec();
        if content.len() != size {
            return Err(Error::InvalidObjectFormat(format!(
                "size mismatch: expected {}, got {}",
                size,
                content.len()
            )));
        }

        Ok(Self { obj_type, content })
    }

    /// Objects this one points at directly (tree entries, commit tree and
    /// parents, tag target). Gitlinks are left out: the commit they name
    /// lives in another repository.
    pub fn references(&self) -> Result<Vec<ObjectId>> {
        match self.obj_type {
            ObjectType::Blob => Ok(Vec::new()),
            ObjectType::Tree => Ok(parse_tree(&self.content)?
                .into_iter()
                .filter(|entry| !entry.is_gitlink())
                .map(|entry| entry.oid)
                .collect()),
            ObjectType::Commit => {
                let commit = Commit::parse(&self.content)?;
                let mut refs = vec![commit.tree];
                refs.extend(commit.parents);
                Ok(refs)
            }
            ObjectType::Tag => Ok(vec![Tag::parse(&self.content)?.object]),
        }
    }
}

pub const MODE_TREE: u32 = 0o40000;
pub const MODE_BLOB: u32 = 0o100644;
pub const MODE_EXECUTABLE: u32 = 0o100755;
pub const MODE_SYMLINK: u32 = 0o120000;
pub const MODE_GITLINK: u32 = 0o160000;

/// Tree entry (mode, name, object id)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: u32,
    pub name: String,
    pub oid: ObjectId,
}

impl TreeEntry {
    pub fn new(mode: u32, name: impl Into<String>, oid: ObjectId) -> Self {
        Self {
            mode,
            name: name.into(),
            oid,
        }
    }

    /// Mode as git writes it (octal, no leading zero)
    pub fn mode_str(&self) -> String {
        format!("{:o}", self.mode)
    }

    pub fn is_tree(&self) -> bool {
        self.mode == MODE_TREE
    }

    pub fn is_blob(&self) -> bool {
        matches!(self.mode, MODE_BLOB | MODE_EXECUTABLE | MODE_SYMLINK)
    }

    pub fn is_gitlink(&self) -> bool {
        self.mode == MODE_GITLINK
    }

    /// Key git sorts tree entries by: subtrees compare as if suffixed by '/'
    fn sort_key(&self) -> Vec<u8> {
        let mut key = self.name.as_bytes().to_vec();
        if self.is_tree() {
            key.push(b'/');
        }
        key
    }
}

/// Parse tree content into entries
pub fn parse_tree(content: &[u8]) -> Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();
    let mut pos = 0;

    while pos < content.len() {
        let space_pos = content[pos..]
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| Error::InvalidObjectFormat("tree: missing space".into()))?;
        let mode_str = std::str::from_utf8(&content[pos..pos + space_pos])
            .map_err(|_| Error::InvalidObjectFormat("tree: invalid mode".into()))?;
        let mode = u32::from_str_radix(mode_str, 8)
            .map_err(|_| Error::InvalidObjectFormat("tree: invalid mode octal".into()))?;
        pos += space_pos + 1;

        let null_pos = content[pos..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::InvalidObjectFormat("tree: missing null".into()))?;
        let name = String::from_utf8_lossy(&content[pos..pos + null_pos]).into_owned();
        pos += null_pos + 1;

        let oid = content
            .get(pos..pos + 20)
            .and_then(ObjectId::from_bytes)
            .ok_or_else(|| Error::InvalidObjectFormat("tree: truncated sha".into()))?;
        pos += 20;

        entries.push(TreeEntry { mode, name, oid });
    }

    Ok(entries)
}

/// Serialize tree entries to content, in git's canonical order
pub fn serialize_tree(entries: &[TreeEntry]) -> Vec<u8> {
    let mut sorted: Vec<&TreeEntry> = entries.iter().collect();
    sorted.sort_by_key(|entry| entry.sort_key());

    let mut content = Vec::new();
    for entry in sorted {
        content.extend_from_slice(entry.mode_str().as_bytes());
        content.push(b' ');
        content.extend_from_slice(entry.name.as_bytes());
        content.push(0);
        content.extend_from_slice(entry.oid.as_bytes());
    }
    content
}

/// Author/committer/tagger line: `Name <email> 1700000000 +0100`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub name: String,
    pub email: String,
    /// Seconds since the epoch
    pub time: i64,
    /// Timezone offset as written, e.g. `+0100`
    pub offset: String,
}

impl Signature {
    pub fn new(name: impl Into<String>, email: impl Into<String>, time: i64) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            time,
            offset: "+0000".to_string(),
        }
    }

    pub fn parse(line: &str) -> Result<Self> {
        let bad = || Error::InvalidObjectFormat(format!("bad signature: {}", line));

        let open = line.find('<').ok_or_else(bad)?;
        let close = line[open..].find('>').map(|i| open + i).ok_or_else(bad)?;
        let name = line[..open].trim_end().to_string();
        let email = line[open + 1..close].to_string();

        let mut rest = line[close + 1..].split_whitespace();
        let time = rest.next().and_then(|t| t.parse().ok()).unwrap_or(0);
        let offset = rest.next().unwrap_or("+0000").to_string();

        Ok(Self {
            name,
            email,
            time,
            offset,
        })
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}> {} {}", self.name, self.email, self.time, self.offset)
    }
}

/// Parsed commit object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    pub author: Signature,
    pub committer: Signature,
    pub message: String,
}

impl Commit {
    pub fn parse(content: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(content);
        let (headers, message) = split_headers(&text);

        let mut tree = None;
        let mut parents = Vec::new();
        let mut author = None;
        let mut committer = None;

        for (name, value) in headers {
            match name {
                "tree" => tree = Some(value.parse::<ObjectId>()?),
                "parent" => parents.push(value.parse::<ObjectId>()?),
                "author" => author = Some(Signature::parse(value)?),
                "committer" => committer = Some(Signature::parse(value)?),
                _ => {}
            }
        }

        let tree = tree.ok_or_else(|| Error::InvalidObjectFormat("commit: missing tree".into()))?;
        let author =
            author.ok_or_else(|| Error::InvalidObjectFormat("commit: missing author".into()))?;
        let committer = committer.unwrap_or_else(|| author.clone());

        Ok(Self {
            tree,
            parents,
            author,
            committer,
            message: message.to_string(),
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = format!("tree {}\n", self.tree);
        for parent in &self.parents {
            out.push_str(&format!("parent {}\n", parent));
        }
        out.push_str(&format!("author {}\n", self.author));
        out.push_str(&format!("committer {}\n", self.committer));
        out.push('\n');
        out.push_str(&self.message);
        out.into_bytes()
    }

    /// First line of the message
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or("")
    }
}

/// Parsed annotated tag object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub object: ObjectId,
    pub target_type: ObjectType,
    pub name: String,
    pub tagger: Option<Signature>,
    pub message: String,
}

impl Tag {
    pub fn parse(content: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(content);
        let (headers, message) = split_headers(&text);

        let mut object = None;
        let mut target_type = None;
        let mut name = String::new();
        let mut tagger = None;

        for (key, value) in headers {
            match key {
                "object" => object = Some(value.parse::<ObjectId>()?),
                "type" => {
                    target_type = Some(
                        ObjectType::parse(value)
                            .ok_or_else(|| Error::InvalidObjectType(value.to_string()))?,
                    )
                }
                "tag" => name = value.to_string(),
                "tagger" => tagger = Some(Signature::parse(value)?),
                _ => {}
            }
        }

        Ok(Self {
            object: object.ok_or_else(|| Error::InvalidObjectFormat("tag: missing object".into()))?,
            target_type: target_type
                .ok_or_else(|| Error::InvalidObjectFormat("tag: missing type".into()))?,
            name,
            tagger,
            message: message.to_string(),
        })
    }
}

/// Split a commit/tag body into `(name, value)` header pairs and the message.
/// Continuation lines (leading space, as in `gpgsig`) are skipped.
fn split_headers(text: &str) -> (Vec<(&str, &str)>, &str) {
    let (head, message) = match text.find("\n\n") {
        Some(pos) => (&text[..pos], &text[pos + 2..]),
        None => (text, ""),
    };

    let headers = head
        .lines()
        .filter(|line| !line.starts_with(' '))
        .filter_map(|line| line.split_once(' '))
        .collect();

    (headers, message)
}
