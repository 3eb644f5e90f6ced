//! Object-store plumbing for depot.
//!
//! A bare git repository lives under one key prefix of a flat object store
//! (`repos/<owner>/<name>.git/HEAD`, `.../objects/ab/cdef..`). This crate
//! provides:
//! - [`ObjectStore`] backends (in-memory, LMDB, and S3 behind the `s3` feature)
//! - [`SharedCache`], the process-wide content/listing cache
//! - [`BucketFs`], a per-request [`RepoFs`] that makes a key prefix look like
//!   a directory tree to the git engine

pub mod bucket_fs;
pub mod cache;
pub mod error;
pub mod fs;
pub mod lmdb;
pub mod path;
#[cfg(feature = "s3")]
pub mod s3;
pub mod store;

pub use bucket_fs::{BucketFs, Prefetch};
pub use cache::{CachePolicy, CacheStats, KeyClass, SharedCache};
pub use error::{Error, Result};
pub use fs::{EntryKind, Metadata, RepoFs, DIR_MODE, FILE_MODE};
pub use lmdb::LmdbObjectStore;
pub use path::{normalize, repo_prefix, resolve_key};
#[cfg(feature = "s3")]
pub use s3::{S3Config, S3ObjectStore};
pub use store::{MemoryObjectStore, ObjectStore, StoreOpStats};
