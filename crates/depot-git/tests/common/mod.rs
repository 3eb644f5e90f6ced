//! A minimal smart HTTP server over depot-git, shared by the integration
//! tests. Every request gets a fresh adapter over one in-memory store, the
//! way the real server scopes adapters to a request.

#![allow(dead_code)]

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use depot_git::http::{handle_info_refs, handle_receive_pack, handle_upload_pack, Service};
use depot_git::object::{serialize_tree, Commit, Signature, TreeEntry, MODE_BLOB};
use depot_git::refs::Ref;
use depot_git::{GitStorage, ObjectId, RefLocks};
use depot_store::{BucketFs, CachePolicy, MemoryObjectStore, Prefetch, SharedCache};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

pub struct TestServer {
    pub store: Arc<MemoryObjectStore>,
    pub cache: Arc<SharedCache>,
    pub locks: RefLocks,
}

impl TestServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            store: Arc::new(MemoryObjectStore::new()),
            cache: Arc::new(SharedCache::new(CachePolicy::default())),
            locks: RefLocks::new(),
        })
    }

    pub async fn storage(&self, repo: &str, prefetch: Prefetch) -> GitStorage {
        let fs = BucketFs::open(self.store.clone(), self.cache.clone(), &prefix(repo), prefetch)
            .await
            .expect("open adapter");
        GitStorage::new(Arc::new(fs))
    }

    /// A bare repository with bootstrap files only
    pub async fn create_repo(&self, repo: &str) -> GitStorage {
        let storage = self.storage(repo, Prefetch::None).await;
        storage.init().await.expect("init repo");
        storage
    }
}

pub fn prefix(repo: &str) -> String {
    format!("repos/1/{}", repo)
}

fn error_response(e: depot_git::Error) -> Response {
    let status = match &e {
        depot_git::Error::ProtocolError(_) => StatusCode::BAD_REQUEST,
        e if e.is_not_found() => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string()).into_response()
}

async fn info_refs_handler(
    Path(repo): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(server): State<Arc<TestServer>>,
) -> Response {
    let Some(service) = params.get("service").and_then(|s| Service::parse(s)) else {
        return (StatusCode::BAD_REQUEST, "invalid service").into_response();
    };

    let storage = server.storage(&repo, Prefetch::AllKeys).await;
    match handle_info_refs(&storage, service).await {
        Ok((content_type, body)) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, content_type),
                (header::CACHE_CONTROL, "no-cache".to_string()),
            ],
            body,
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn upload_pack_handler(
    Path(repo): Path<String>,
    State(server): State<Arc<TestServer>>,
    body: Bytes,
) -> Response {
    let storage = server.storage(&repo, Prefetch::AllKeys).await;
    match handle_upload_pack(&storage, &body).await {
        Ok(response) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, Service::UploadPack.result_content_type())],
            response,
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn receive_pack_handler(
    Path(repo): Path<String>,
    State(server): State<Arc<TestServer>>,
    body: Bytes,
) -> Response {
    let storage = server.storage(&repo, Prefetch::None).await;
    match handle_receive_pack(&storage, &server.locks, &prefix(&repo), &body).await {
        Ok(response) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, Service::ReceivePack.result_content_type())],
            response,
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn start_test_server(server: Arc<TestServer>) -> SocketAddr {
    let router = Router::new()
        .route("/:repo/info/refs", get(info_refs_handler))
        .route("/:repo/git-upload-pack", post(upload_pack_handler))
        .route("/:repo/git-receive-pack", post(receive_pack_handler))
        .with_state(server);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

/// Create a reqwest client with reasonable timeouts
pub fn test_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// Run a blocking git2 operation with timeout
pub async fn with_timeout<T, F>(timeout_secs: u64, f: F) -> Result<T, &'static str>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::task::spawn_blocking(f);
    match tokio::time::timeout(Duration::from_secs(timeout_secs), handle).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(_)) => Err("task panicked"),
        Err(_) => Err("timeout"),
    }
}

/// Write a commit of `files` on top of `parents` and return its id
pub async fn write_commit(
    storage: &GitStorage,
    files: &[(&str, &str)],
    parents: Vec<ObjectId>,
    time: i64,
    message: &str,
) -> ObjectId {
    let mut entries = Vec::new();
    for (name, content) in files {
        let blob = storage.write_blob(content.as_bytes()).await.unwrap();
        entries.push(TreeEntry::new(MODE_BLOB, *name, blob));
    }
    let tree = storage.write_tree(&serialize_tree(&entries)).await.unwrap();
    let sig = Signature::new("Test", "test@test.com", time);
    let commit = Commit {
        tree,
        parents,
        author: sig.clone(),
        committer: sig,
        message: format!("{}\n", message),
    };
    storage.write_commit(&commit.serialize()).await.unwrap()
}

/// Point `refs/heads/<branch>` at `oid`
pub async fn set_branch(storage: &GitStorage, branch: &str, oid: ObjectId) {
    storage
        .write_ref(&format!("refs/heads/{}", branch), &Ref::Direct(oid))
        .await
        .unwrap();
}
