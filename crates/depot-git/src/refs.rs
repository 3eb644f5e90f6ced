//! Git references (branches, tags, HEAD)
//!
//! Refs are named pointers to commits. In a bare repository they are small
//! files under `refs/`, plus `HEAD` at the root:
//! - refs/heads/* - branches
//! - refs/tags/* - tags
//! - HEAD - symbolic ref (`ref: refs/heads/main`) or direct pointer
//!
//! A read-only `packed-refs` file is honored as a fallback for refs that
//! have no loose file.

use std::collections::BTreeMap;

use crate::object::ObjectId;
use crate::{Error, Result};

/// A git reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ref {
    /// Direct reference to an object
    Direct(ObjectId),
    /// Symbolic reference to another ref (e.g., HEAD -> refs/heads/main)
    Symbolic(String),
}

impl Ref {
    pub fn direct(oid: ObjectId) -> Self {
        Ref::Direct(oid)
    }

    pub fn symbolic(target: impl Into<String>) -> Self {
        Ref::Symbolic(target.into())
    }

    /// Parse the content of a loose ref file.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if let Some(target) = value.strip_prefix("ref:") {
            return Ok(Ref::Symbolic(target.trim().to_string()));
        }
        ObjectId::from_hex(value)
            .map(Ref::Direct)
            .ok_or_else(|| Error::InvalidObjectFormat(format!("invalid oid in ref: {}", value)))
    }

    /// Loose ref file content, newline terminated
    pub fn to_file_content(&self) -> String {
        match self {
            Ref::Direct(oid) => format!("{}\n", oid),
            Ref::Symbolic(target) => format!("ref: {}\n", target),
        }
    }
}

/// Reference with its full name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedRef {
    pub name: String,
    pub reference: Ref,
}

impl NamedRef {
    pub fn new(name: impl Into<String>, reference: Ref) -> Self {
        Self {
            name: name.into(),
            reference,
        }
    }
}

/// Validate a ref name according to git rules
pub fn validate_ref_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidRefName("empty ref name".into()));
    }

    if name.starts_with('/') || name.ends_with('/') {
        return Err(Error::InvalidRefName("cannot start or end with /".into()));
    }

    if name.contains("//") {
        return Err(Error::InvalidRefName("cannot contain //".into()));
    }

    // Also keeps ref paths from escaping the repository prefix
    if name.contains("..") {
        return Err(Error::InvalidRefName("cannot contain ..".into()));
    }

    for c in name.chars() {
        if c.is_control() || matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\') {
            return Err(Error::InvalidRefName(format!("invalid character: {:?}", c)));
        }
    }

    if name.split('/').any(|component| component.starts_with('.')) {
        return Err(Error::InvalidRefName("component cannot start with .".into()));
    }

    if name.ends_with(".lock") {
        return Err(Error::InvalidRefName("cannot end with .lock".into()));
    }

    if name.contains("@{") {
        return Err(Error::InvalidRefName("cannot contain @{".into()));
    }

    if name == "@" {
        return Err(Error::InvalidRefName("cannot be @".into()));
    }

    if name.ends_with('.') {
        return Err(Error::InvalidRefName("cannot end with .".into()));
    }

    Ok(())
}

/// Validate a ref that a client may update: must live under `refs/`.
pub fn validate_update_ref_name(name: &str) -> Result<()> {
    validate_ref_name(name)?;
    if !name.starts_with("refs/") || name.matches('/').count() < 2 {
        return Err(Error::InvalidRefName(format!("not an updatable ref: {}", name)));
    }
    Ok(())
}

/// Parse `packed-refs` content into `name → oid`. Peeled lines (`^...`)
/// and comments are skipped.
pub fn parse_packed_refs(content: &str) -> BTreeMap<String, ObjectId> {
    content
        .lines()
        .filter(|line| !line.starts_with('#') && !line.starts_with('^'))
        .filter_map(|line| {
            let (hex, name) = line.split_once(' ')?;
            Some((name.trim().to_string(), ObjectId::from_hex(hex)?))
        })
        .collect()
}

/// Common ref constants
pub const HEAD: &str = "HEAD";
pub const REFS_HEADS: &str = "refs/heads/";
pub const REFS_TAGS: &str = "refs/tags/";
pub const DEFAULT_BRANCH: &str = "main";

/// Create a branch ref name
pub fn branch_ref(name: &str) -> String {
    format!("{}{}", REFS_HEADS, name)
}

/// Create a tag ref name
pub fn tag_ref(name: &str) -> String {
    format!("{}{}", REFS_TAGS, name)
}

/// Extract branch name from full ref
pub fn branch_name(full_ref: &str) -> Option<&str> {
    full_ref.strip_prefix(REFS_HEADS)
}

/// Extract tag name from full ref
pub fn tag_name(full_ref: &str) -> Option<&str> {
    full_ref.strip_prefix(REFS_TAGS)
}
