//! End-to-end tests against the full depot router: repository directory,
//! auth, git smart HTTP, raw files and the JSON API.

use depot::config::UserConfig;
use depot::directory::open_repo;
use depot::{AppState, DepotServer, RepoDirectory, StaticDirectory};
use depot_git::object::{serialize_tree, Commit, Signature, TreeEntry, MODE_BLOB};
use depot_git::refs::Ref;
use depot_git::storage::{INITIAL_CONFIG, INITIAL_DESCRIPTION, INITIAL_HEAD};
use depot_git::{GitStorage, ObjectId};
use depot_store::{CachePolicy, MemoryObjectStore, ObjectStore, Prefetch, SharedCache};
use git2::{Cred, PushOptions, RemoteCallbacks, Repository};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::net::TcpListener;

struct Harness {
    addr: SocketAddr,
    store: Arc<MemoryObjectStore>,
    cache: Arc<SharedCache>,
    directory: Arc<StaticDirectory>,
}

fn user(id: &str, name: &str) -> UserConfig {
    UserConfig {
        id: id.to_string(),
        username: name.to_string(),
        api_keys: vec![format!("{}-key", name)],
        session_tokens: vec![format!("{}-session", name)],
    }
}

impl Harness {
    async fn start() -> Self {
        let store = Arc::new(MemoryObjectStore::new());
        let cache = Arc::new(SharedCache::new(CachePolicy::default()));
        let directory = Arc::new(
            StaticDirectory::from_config(
                store.clone(),
                cache.clone(),
                &[user("1", "alice"), user("2", "bob")],
                &[],
            )
            .unwrap(),
        );

        let state = AppState::new(store.clone(), cache.clone(), directory.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = DepotServer::new(state, addr.to_string());
        tokio::spawn(async move {
            server.serve(listener).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        Self {
            addr,
            store,
            cache,
            directory,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn create_repo(&self, owner: &str, name: &str, private: bool) -> GitStorage {
        let user = self.directory.user(owner).unwrap();
        let repo = self.directory.create_repository(&user, name, private).await.unwrap();
        open_repo(self.store.clone(), self.cache.clone(), &repo.prefix, Prefetch::None)
            .await
            .unwrap()
    }
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

async fn commit_files(
    storage: &GitStorage,
    files: &[(&str, &[u8])],
    parents: Vec<ObjectId>,
    time: i64,
    message: &str,
) -> ObjectId {
    let mut entries = Vec::new();
    for (name, content) in files {
        let blob = storage.write_blob(content).await.unwrap();
        entries.push(TreeEntry::new(MODE_BLOB, *name, blob));
    }
    let tree = storage.write_tree(&serialize_tree(&entries)).await.unwrap();
    let sig = Signature::new("Alice", "alice@example.com", time);
    let commit = Commit {
        tree,
        parents,
        author: sig.clone(),
        committer: sig,
        message: format!("{}\n", message),
    };
    let oid = storage.write_commit(&commit.serialize()).await.unwrap();
    storage
        .write_ref("refs/heads/main", &Ref::Direct(oid))
        .await
        .unwrap();
    oid
}

/// Push callbacks authenticating as `user`; a rejected ref fails the push
fn push_options<'a>(user: &'a str) -> PushOptions<'a> {
    let mut callbacks = RemoteCallbacks::new();
    let mut attempts = 0;
    callbacks.credentials(move |_url, _username, _allowed| {
        attempts += 1;
        if attempts > 3 {
            return Err(git2::Error::from_str("credentials rejected"));
        }
        Cred::userpass_plaintext(user, &format!("{}-key", user))
    });
    callbacks.push_update_reference(|name, status| match status {
        None => Ok(()),
        Some(msg) => Err(git2::Error::from_str(&format!("{} rejected: {}", name, msg))),
    });
    let mut opts = PushOptions::new();
    opts.remote_callbacks(callbacks);
    opts
}

fn commit_file(repo: &Repository, name: &str, content: &str, message: &str) -> git2::Oid {
    let workdir = repo.workdir().unwrap().to_path_buf();
    std::fs::write(workdir.join(name), content).unwrap();

    let mut index = repo.index().unwrap();
    index.add_path(std::path::Path::new(name)).unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();

    let sig = git2::Signature::now("Alice", "alice@example.com").unwrap();
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents).unwrap()
}

fn push_head(repo: &Repository, url: &str, user: &str) {
    let head = repo.head().unwrap().name().unwrap().to_string();
    let mut remote = match repo.find_remote("origin") {
        Ok(remote) => remote,
        Err(_) => repo.remote("origin", url).unwrap(),
    };
    remote
        .push(&[format!("{}:refs/heads/main", head)], Some(&mut push_options(user)))
        .unwrap();
}

async fn blocking<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    tokio::time::timeout(Duration::from_secs(30), tokio::task::spawn_blocking(f))
        .await
        .expect("timed out")
        .expect("task panicked")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_create_repo_bootstrap() {
    let h = Harness::start().await;
    let http = client();

    let resp = http
        .post(h.url("/api/repos"))
        .json(&serde_json::json!({ "name": "demo" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = http
        .post(h.url("/api/repos"))
        .basic_auth("alice", Some("alice-key"))
        .json(&serde_json::json!({ "name": "demo" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    assert_eq!(
        h.store.keys(),
        vec![
            "repos/1/demo.git/HEAD",
            "repos/1/demo.git/config",
            "repos/1/demo.git/description",
        ]
    );
    let head = h.store.get("repos/1/demo.git/HEAD").await.unwrap().unwrap();
    assert_eq!(&head[..], INITIAL_HEAD.as_bytes());
    let config = h.store.get("repos/1/demo.git/config").await.unwrap().unwrap();
    assert_eq!(&config[..], INITIAL_CONFIG.as_bytes());
    let description = h.store.get("repos/1/demo.git/description").await.unwrap().unwrap();
    assert_eq!(&description[..], INITIAL_DESCRIPTION.as_bytes());

    let resp = http
        .get(h.url("/alice/demo.git/info/refs?service=git-upload-pack"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body = resp.text().await.unwrap();
    assert!(body.starts_with("001e# service=git-upload-pack\n0000"));
    assert!(body.contains(&format!("{} capabilities^{{}}", ObjectId::ZERO)));
    assert!(!body.contains("refs/heads"));

    // Same name again
    let resp = http
        .post(h.url("/api/repos"))
        .bearer_auth("alice-session")
        .json(&serde_json::json!({ "name": "demo" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
}

/// Scenario: push one commit on main, clone from a second client and get
/// the same tree back.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_push_then_clone_over_http() {
    let h = Harness::start().await;
    h.create_repo("alice", "demo", false).await;
    let url = h.url("/alice/demo.git");

    let work = tempdir().unwrap();
    let work_path = work.path().to_path_buf();
    let push_url = url.clone();
    let pushed = blocking(move || {
        let repo = Repository::init(&work_path).unwrap();
        let oid = commit_file(&repo, "README.md", "# demo\n\nhello\n", "Initial commit");
        push_head(&repo, &push_url, "alice");
        oid.to_string()
    })
    .await;

    let clone_dir = tempdir().unwrap();
    let clone_path = clone_dir.path().join("demo");
    let cloned = blocking(move || {
        let repo = Repository::clone(&url, &clone_path).unwrap();
        let head = repo.head().unwrap();
        let readme = std::fs::read_to_string(clone_path.join("README.md")).unwrap();
        (head.name().map(str::to_string), head.target().unwrap().to_string(), readme)
    })
    .await;

    assert_eq!(cloned.0.as_deref(), Some("refs/heads/main"));
    assert_eq!(cloned.1, pushed);
    assert_eq!(cloned.2, "# demo\n\nhello\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_push_requires_owner() {
    let h = Harness::start().await;
    h.create_repo("alice", "demo", false).await;
    let http = client();

    let resp = http
        .get(h.url("/alice/demo.git/info/refs?service=git-receive-pack"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    assert_eq!(
        resp.headers().get("www-authenticate").unwrap(),
        "Basic realm=\"depot\""
    );

    let resp = http
        .get(h.url("/alice/demo.git/info/refs?service=git-receive-pack"))
        .basic_auth("bob", Some("bob-key"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    let resp = http
        .post(h.url("/alice/demo.git/git-receive-pack"))
        .basic_auth("alice", Some("wrong"))
        .body("0000")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = http
        .get(h.url("/alice/demo.git/info/refs?service=git-receive-pack"))
        .basic_auth("alice", Some("alice-key"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("cache-control").unwrap(), "no-cache");
}

/// Scenario: a 500-byte README read with `Range: bytes=0-9`.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_file_range_request() {
    let h = Harness::start().await;
    let storage = h.create_repo("alice", "demo", false).await;
    let readme: Vec<u8> = (0..500u32).map(|i| b'a' + (i % 26) as u8).collect();
    commit_files(&storage, &[("README.md", &readme[..])], vec![], 1_700_000_000, "readme").await;
    let http = client();

    let resp = http
        .get(h.url("/file/alice/demo/main/README.md"))
        .header("Range", "bytes=0-9")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(resp.headers().get("content-range").unwrap(), "bytes 0-9/500");
    assert_eq!(resp.headers().get("accept-ranges").unwrap(), "bytes");
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "text/markdown; charset=utf-8"
    );
    assert_eq!(&resp.bytes().await.unwrap()[..], &readme[..10]);

    let resp = http
        .get(h.url("/file/alice/demo/main/README.md"))
        .header("Range", "bytes=490-")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(resp.headers().get("content-range").unwrap(), "bytes 490-499/500");
    assert_eq!(&resp.bytes().await.unwrap()[..], &readme[490..]);

    let resp = http
        .get(h.url("/file/alice/demo/main/README.md"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("accept-ranges").unwrap(), "bytes");
    assert_eq!(&resp.bytes().await.unwrap()[..], &readme[..]);

    let resp = http
        .get(h.url("/file/alice/demo/main/README.md"))
        .header("Range", "bytes=500-")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 416);

    let resp = http
        .get(h.url("/file/alice/demo/main/missing/file.txt"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["error"].is_string());

    let resp = http
        .get(h.url("/file/alice/demo/nope/README.md"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_large_file_streams_whole() {
    let h = Harness::start().await;
    let storage = h.create_repo("alice", "demo", false).await;
    let data: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    commit_files(&storage, &[("blob.bin", &data[..])], vec![], 1_700_000_000, "bin").await;

    let resp = client()
        .get(h.url("/file/alice/demo/main/blob.bin"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "application/octet-stream"
    );
    let body = resp.bytes().await.unwrap();
    assert_eq!(body.len(), data.len());
    assert_eq!(&body[..], &data[..]);
}

/// Scenario: two pushes to main; the branch ends at the second and the
/// log lists both in parent order.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_pushes_and_log() {
    let h = Harness::start().await;
    h.create_repo("alice", "demo", false).await;
    let url = h.url("/alice/demo.git");

    let work = tempdir().unwrap();
    let work_path = work.path().to_path_buf();
    let (first, second) = blocking(move || {
        let repo = Repository::init(&work_path).unwrap();
        let first = commit_file(&repo, "a.txt", "one\n", "first");
        push_head(&repo, &url, "alice");
        let second = commit_file(&repo, "a.txt", "two\n", "second");
        push_head(&repo, &url, "alice");
        (first.to_string(), second.to_string())
    })
    .await;

    let http = client();
    let body: serde_json::Value = http
        .get(h.url("/api/alice/demo/commits/main"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let commits = body["commits"].as_array().unwrap();
    assert_eq!(commits.len(), 2);
    assert_eq!(commits[0]["oid"], second);
    assert_eq!(commits[0]["summary"], "second");
    assert_eq!(commits[0]["parents"], serde_json::json!([first]));
    assert_eq!(commits[1]["oid"], first);
    assert_eq!(commits[1]["parents"], serde_json::json!([]));

    let body: serde_json::Value = http
        .get(h.url("/api/alice/demo/branches"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        body["branches"],
        serde_json::json!([{ "name": "main", "commit": second, "head": true }])
    );

    let resp = http
        .get(h.url("/api/alice/demo/commits/nope"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_private_repo_hides_refs() {
    let h = Harness::start().await;
    let storage = h.create_repo("alice", "secret", true).await;
    commit_files(&storage, &[("a.txt", &b"x\n"[..])], vec![], 1_700_000_000, "hidden").await;
    let http = client();
    let refs = h.url("/alice/secret.git/info/refs?service=git-upload-pack");

    let resp = http.get(&refs).send().await.unwrap();
    assert_eq!(resp.status(), 401);
    let body = resp.bytes().await.unwrap();
    assert!(!String::from_utf8_lossy(&body).contains("refs/heads"));

    let resp = http.get(&refs).bearer_auth("bob-session").send().await.unwrap();
    assert_eq!(resp.status(), 403);
    let body = resp.bytes().await.unwrap();
    assert!(!String::from_utf8_lossy(&body).contains("refs/heads"));

    let resp = http.get(&refs).bearer_auth("alice-session").send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.text().await.unwrap().contains("refs/heads/main"));

    // Every read surface is guarded
    let resp = http
        .get(h.url("/file/alice/secret/main/a.txt"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let resp = http
        .get(h.url("/api/alice/secret/branches"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let resp = http
        .post(h.url("/alice/secret.git/git-upload-pack"))
        .body("0000")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_repo_and_service() {
    let h = Harness::start().await;
    h.create_repo("alice", "demo", false).await;
    let http = client();

    let resp = http
        .get(h.url("/alice/nothere.git/info/refs?service=git-upload-pack"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = http
        .get(h.url("/carol/demo.git/info/refs?service=git-upload-pack"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = http
        .get(h.url("/alice/demo.git/info/refs?service=git-archive"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = http
        .post(h.url("/alice/demo/git-upload-pack"))
        .body("zzzz")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delete_repo() {
    let h = Harness::start().await;
    let storage = h.create_repo("alice", "demo", false).await;
    commit_files(&storage, &[("a.txt", &b"x\n"[..])], vec![], 1_700_000_000, "one").await;
    h.create_repo("alice", "keep", false).await;
    let http = client();

    let resp = http
        .delete(h.url("/api/alice/demo"))
        .basic_auth("bob", Some("bob-key"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    let resp = http
        .delete(h.url("/api/alice/demo"))
        .basic_auth("alice", Some("alice-key"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    assert!(h
        .store
        .keys()
        .iter()
        .all(|k| k.starts_with("repos/1/keep.git/")));
    assert!(h.directory.get_repo_owner_and_repo("alice", "demo").await.is_none());

    let resp = http
        .get(h.url("/alice/demo.git/info/refs?service=git-upload-pack"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}
