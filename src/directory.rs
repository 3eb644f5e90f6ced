//! Repository directory: who owns which repository, and who is asking.
//!
//! The HTTP layer only needs a narrow view of users and repositories. A
//! deployment with a relational store implements [`RepoDirectory`] over it;
//! [`StaticDirectory`] serves the `[[users]]` and `[[repos]]` tables of the
//! config file and can be changed at runtime.

use async_trait::async_trait;
use depot_git::GitStorage;
use depot_store::{repo_prefix, BucketFs, ObjectStore, Prefetch, SharedCache};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{RepoConfig, UserConfig};

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("repository already exists: {0}")]
    AlreadyExists(String),

    #[error("repository not found: {0}")]
    NotFound(String),

    #[error("invalid repository name: {0}")]
    InvalidName(String),

    #[error(transparent)]
    Git(#[from] depot_git::Error),
}

pub type Result<T> = std::result::Result<T, DirectoryError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub name: String,
    pub private: bool,
    /// Storage prefix, `repos/{owner_id}/{name}.git`
    pub prefix: String,
}

/// Credentials presented with a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// HTTP Basic: username and API key
    Basic { username: String, api_key: String },
    /// Bearer session token
    Bearer(String),
}

#[async_trait]
pub trait RepoDirectory: Send + Sync {
    /// Look up a repository by owner username and name.
    async fn get_repo_owner_and_repo(
        &self,
        username: &str,
        repo_name: &str,
    ) -> Option<(User, Repository)>;

    /// The user these credentials belong to, if they are valid.
    async fn authenticate(&self, credentials: &Credentials) -> Option<User>;

    /// Register a repository and write its bootstrap files.
    async fn create_repository(&self, owner: &User, name: &str, private: bool) -> Result<Repository>;

    /// Unregister a repository and delete its keys.
    async fn remove_repository(&self, owner: &User, name: &str) -> Result<()>;
}

/// Open a git storage over one repository prefix
pub async fn open_repo(
    store: Arc<dyn ObjectStore>,
    cache: Arc<SharedCache>,
    prefix: &str,
    prefetch: Prefetch,
) -> depot_git::Result<GitStorage> {
    let fs = BucketFs::open(store, cache, prefix, prefetch).await?;
    Ok(GitStorage::new(Arc::new(fs)))
}

/// Strip an optional `.git` suffix and check the name is usable as a
/// single path segment.
pub fn validate_repo_name(name: &str) -> Result<&str> {
    let name = name.strip_suffix(".git").unwrap_or(name);
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(name)
    } else {
        Err(DirectoryError::InvalidName(name.to_string()))
    }
}

#[derive(Default)]
struct Tables {
    users: Vec<UserConfig>,
    /// (owner username, repo name) -> repo
    repos: HashMap<(String, String), RepoConfig>,
}

impl Tables {
    fn user_by_name(&self, username: &str) -> Option<&UserConfig> {
        self.users.iter().find(|u| u.username == username)
    }
}

/// Directory backed by in-memory user and repository tables.
pub struct StaticDirectory {
    store: Arc<dyn ObjectStore>,
    cache: Arc<SharedCache>,
    tables: RwLock<Tables>,
}

fn to_user(user: &UserConfig) -> User {
    User {
        id: user.id.clone(),
        username: user.username.clone(),
    }
}

impl StaticDirectory {
    pub fn new(store: Arc<dyn ObjectStore>, cache: Arc<SharedCache>) -> Self {
        Self {
            store,
            cache,
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Build from config tables. Every repository owner must be a known user.
    pub fn from_config(
        store: Arc<dyn ObjectStore>,
        cache: Arc<SharedCache>,
        users: &[UserConfig],
        repos: &[RepoConfig],
    ) -> Result<Self> {
        let directory = Self::new(store, cache);
        {
            let mut tables = directory.write();
            tables.users = users.to_vec();
            for repo in repos {
                if tables.user_by_name(&repo.owner).is_none() {
                    return Err(DirectoryError::UnknownUser(repo.owner.clone()));
                }
                let name = validate_repo_name(&repo.name)?.to_string();
                tables.repos.insert(
                    (repo.owner.clone(), name.clone()),
                    RepoConfig {
                        owner: repo.owner.clone(),
                        name,
                        private: repo.private,
                    },
                );
            }
        }
        Ok(directory)
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add or replace a user (matched by username)
    pub fn upsert_user(&self, user: UserConfig) {
        let mut tables = self.write();
        tables.users.retain(|u| u.username != user.username);
        tables.users.push(user);
    }

    pub fn user(&self, username: &str) -> Option<User> {
        self.read().user_by_name(username).map(to_user)
    }

    /// All registered repositories as (owner username, repo)
    pub fn repositories(&self) -> Vec<RepoConfig> {
        let mut repos: Vec<RepoConfig> = self.read().repos.values().cloned().collect();
        repos.sort_by(|a, b| (&a.owner, &a.name).cmp(&(&b.owner, &b.name)));
        repos
    }

    /// Write bootstrap files for registered repositories that have none yet
    pub async fn ensure_initialized(&self) -> Result<usize> {
        let mut created = 0;
        for repo in self.repositories() {
            let Some((owner, repo)) = self.get_repo_owner_and_repo(&repo.owner, &repo.name).await
            else {
                continue;
            };
            let storage = self.open(&repo.prefix, Prefetch::None).await?;
            if !storage.exists().await? {
                storage.init().await?;
                info!("initialized {}/{} at {}", owner.username, repo.name, repo.prefix);
                created += 1;
            }
        }
        Ok(created)
    }

    async fn open(&self, prefix: &str, prefetch: Prefetch) -> Result<GitStorage> {
        Ok(open_repo(self.store.clone(), self.cache.clone(), prefix, prefetch).await?)
    }
}

#[async_trait]
impl RepoDirectory for StaticDirectory {
    async fn get_repo_owner_and_repo(
        &self,
        username: &str,
        repo_name: &str,
    ) -> Option<(User, Repository)> {
        let name = repo_name.strip_suffix(".git").unwrap_or(repo_name);
        let tables = self.read();
        let user = tables.user_by_name(username)?;
        let repo = tables.repos.get(&(username.to_string(), name.to_string()))?;
        Some((
            to_user(user),
            Repository {
                name: repo.name.clone(),
                private: repo.private,
                prefix: repo_prefix(&user.id, &repo.name),
            },
        ))
    }

    async fn authenticate(&self, credentials: &Credentials) -> Option<User> {
        let tables = self.read();
        let user = match credentials {
            Credentials::Basic { username, api_key } => tables
                .user_by_name(username)
                .filter(|u| u.api_keys.iter().any(|k| k == api_key)),
            Credentials::Bearer(token) => tables
                .users
                .iter()
                .find(|u| u.session_tokens.iter().any(|t| t == token)),
        };
        user.map(to_user)
    }

    async fn create_repository(&self, owner: &User, name: &str, private: bool) -> Result<Repository> {
        let name = validate_repo_name(name)?.to_string();
        {
            let mut tables = self.write();
            if tables.user_by_name(&owner.username).is_none() {
                return Err(DirectoryError::UnknownUser(owner.username.clone()));
            }
            let key = (owner.username.clone(), name.clone());
            if tables.repos.contains_key(&key) {
                return Err(DirectoryError::AlreadyExists(format!("{}/{}", owner.username, name)));
            }
            tables.repos.insert(
                key,
                RepoConfig {
                    owner: owner.username.clone(),
                    name: name.clone(),
                    private,
                },
            );
        }

        let repo = Repository {
            prefix: repo_prefix(&owner.id, &name),
            name,
            private,
        };
        let bootstrap = async {
            let storage = self.open(&repo.prefix, Prefetch::None).await?;
            storage.init().await?;
            Ok::<_, DirectoryError>(())
        };
        if let Err(e) = bootstrap.await {
            self.write()
                .repos
                .remove(&(owner.username.clone(), repo.name.clone()));
            return Err(e);
        }

        info!("created repository {}/{} at {}", owner.username, repo.name, repo.prefix);
        Ok(repo)
    }

    async fn remove_repository(&self, owner: &User, name: &str) -> Result<()> {
        let name = name.strip_suffix(".git").unwrap_or(name);
        let removed = self
            .write()
            .repos
            .remove(&(owner.username.clone(), name.to_string()));
        if removed.is_none() {
            return Err(DirectoryError::NotFound(format!("{}/{}", owner.username, name)));
        }

        // The record is gone either way; leftover keys are only logged
        let prefix = repo_prefix(&owner.id, name);
        let result = async {
            let storage = self.open(&prefix, Prefetch::None).await?;
            storage.destroy().await?;
            Ok::<_, DirectoryError>(())
        }
        .await;
        match result {
            Ok(()) => info!("removed repository {}/{}", owner.username, name),
            Err(e) => warn!("failed to delete keys under {}: {}", prefix, e),
        }
        Ok(())
    }
}
