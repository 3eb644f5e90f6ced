//! Git smart HTTP protocol over an object store
//!
//! Every read and write goes through a [`depot_store::RepoFs`], so a
//! repository is just a set of keys under one storage prefix. Supports
//! fetch (git-upload-pack) and push (git-receive-pack), plus the history
//! queries the web surface needs.

pub mod error;
pub mod history;
pub mod http;
pub mod locks;
pub mod object;
pub mod pack;
pub mod protocol;
pub mod refs;
pub mod storage;

pub use error::{Error, Result};
pub use history::{Branch, LogEntry};
pub use http::Service;
pub use locks::RefLocks;
pub use object::{Commit, ObjectId, ObjectType};
pub use storage::GitStorage;
