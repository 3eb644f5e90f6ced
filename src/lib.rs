//! depot: git repositories stored in an object store, served over git's
//! smart HTTP protocol.

pub mod config;
pub mod directory;
pub mod server;

pub use config::Config;
pub use directory::{Credentials, RepoDirectory, Repository, StaticDirectory, User};
pub use server::{AppState, DepotServer};
