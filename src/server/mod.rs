mod api;
mod auth;
mod file;
mod git;
mod mime;

use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use depot_git::{GitStorage, RefLocks};
use depot_store::{ObjectStore, Prefetch, SharedCache};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::directory::{open_repo, RepoDirectory};

pub use auth::{parse_credentials, Denied};
pub use file::{parse_range, ByteRange, FILE_CHUNK_SIZE};
pub use mime::content_type_for;

/// Shared by every request: the object store, the process-wide cache,
/// the repository directory and the per-repository ref locks.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ObjectStore>,
    pub cache: Arc<SharedCache>,
    pub directory: Arc<dyn RepoDirectory>,
    pub locks: Arc<RefLocks>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        cache: Arc<SharedCache>,
        directory: Arc<dyn RepoDirectory>,
    ) -> Self {
        Self {
            store,
            cache,
            directory,
            locks: Arc::new(RefLocks::new()),
        }
    }

    /// A fresh adapter scoped to one repository, for one request
    pub async fn storage(&self, prefix: &str, prefetch: Prefetch) -> depot_git::Result<GitStorage> {
        open_repo(self.store.clone(), self.cache.clone(), prefix, prefetch).await
    }
}

pub struct DepotServer {
    state: AppState,
    addr: String,
    max_body_bytes: usize,
}

impl DepotServer {
    pub fn new(state: AppState, addr: String) -> Self {
        Self {
            state,
            addr,
            max_body_bytes: 512 * 1024 * 1024,
        }
    }

    pub fn with_max_body_mb(mut self, mb: usize) -> Self {
        self.max_body_bytes = mb * 1024 * 1024;
        self
    }

    pub fn router(&self) -> Router {
        // Fixed prefixes (/file, /api) win over the /:owner/:repo routes
        Router::new()
            .route("/file/:owner/:repo/:branch/*path", get(file::serve_file))
            .route("/api/repos", post(api::create_repo))
            .route("/api/:owner/:repo", delete(api::delete_repo))
            .route("/api/:owner/:repo/branches", get(api::list_branches))
            .route("/api/:owner/:repo/commits/:branch", get(api::list_commits))
            .route("/:owner/:repo/info/refs", get(git::info_refs))
            .route("/:owner/:repo/git-upload-pack", post(git::upload_pack))
            .route("/:owner/:repo/git-receive-pack", post(git::receive_pack))
            .layer(DefaultBodyLimit::max(self.max_body_bytes))
            .with_state(self.state.clone())
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let app = self.router();
        info!("depot listening on {}", listener.local_addr()?);
        axum::serve(listener, app).await?;
        Ok(())
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        self.serve(listener).await
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}
