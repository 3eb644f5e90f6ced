use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use depot::config::{get_config_path, Backend, RepoConfig, StorageConfig};
use depot::directory::open_repo;
use depot::{AppState, Config, DepotServer, RepoDirectory, StaticDirectory};
use depot_git::history;
use depot_store::{LmdbObjectStore, MemoryObjectStore, ObjectStore, Prefetch, SharedCache};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "depot")]
#[command(about = "Git smart HTTP hosting on top of an object store", long_about = None)]
struct Cli {
    /// Config file (default ~/.depot/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Start {
        /// Overrides server.bind_address
        #[arg(long)]
        addr: Option<String>,
    },
    /// Create a repository and record it in the config
    InitRepo {
        owner: String,
        name: String,
        #[arg(long)]
        private: bool,
    },
    /// Delete a repository and all of its keys
    DeleteRepo { owner: String, name: String },
    /// List the branches of a repository
    Branches { owner: String, repo: String },
    /// Show the commit log of a branch
    Log {
        owner: String,
        repo: String,
        #[arg(default_value = "main")]
        branch: String,
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
    /// Print a file at a branch, tag or commit
    Cat {
        owner: String,
        repo: String,
        commitish: String,
        path: String,
    },
}

async fn open_store(storage: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
    match storage.backend {
        Backend::Memory => {
            warn!("memory backend: repositories are lost on exit");
            Ok(Arc::new(MemoryObjectStore::new()))
        }
        Backend::Lmdb => {
            let path = Path::new(&storage.data_dir).join("objects");
            let store = LmdbObjectStore::new(&path)
                .with_context(|| format!("Failed to open LMDB store at {}", path.display()))?;
            Ok(Arc::new(store))
        }
        #[cfg(feature = "s3")]
        Backend::S3 => {
            let s3 = storage
                .s3
                .as_ref()
                .context("storage.backend = \"s3\" needs a [storage.s3] section")?;
            let store = depot_store::S3ObjectStore::new(depot_store::S3Config {
                bucket: s3.bucket.clone(),
                prefix: s3.prefix.clone(),
                region: s3.region.clone(),
                endpoint: s3.endpoint.clone(),
            })
            .await
            .context("Failed to create S3 client")?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "s3"))]
        Backend::S3 => anyhow::bail!("depot was built without the `s3` feature"),
    }
}

struct App {
    config: Config,
    config_path: PathBuf,
    store: Arc<dyn ObjectStore>,
    cache: Arc<SharedCache>,
    directory: Arc<StaticDirectory>,
}

impl App {
    async fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = path.unwrap_or_else(get_config_path);
        let config = Config::load_from(&config_path)?;

        let store = open_store(&config.storage).await?;
        let cache = Arc::new(SharedCache::new(config.cache.to_policy()));
        let directory = Arc::new(
            StaticDirectory::from_config(store.clone(), cache.clone(), &config.users, &config.repos)
                .context("Invalid [[users]]/[[repos]] tables")?,
        );

        Ok(Self {
            config,
            config_path,
            store,
            cache,
            directory,
        })
    }

    async fn repo_storage(&self, owner: &str, repo: &str) -> Result<depot_git::GitStorage> {
        let (_, repo) = self
            .directory
            .get_repo_owner_and_repo(owner, repo)
            .await
            .with_context(|| format!("No repository {}/{}", owner, repo))?;
        Ok(open_repo(self.store.clone(), self.cache.clone(), &repo.prefix, Prefetch::AllKeys).await?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("depot=info".parse().context("bad log directive")?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let ctx = App::load(cli.config).await?;

    match cli.command {
        Commands::Start { addr } => {
            let created = ctx.directory.ensure_initialized().await?;
            if created > 0 {
                info!("initialized {} configured repositories", created);
            }

            let addr = addr.unwrap_or_else(|| ctx.config.server.bind_address.clone());
            let state = AppState::new(ctx.store.clone(), ctx.cache.clone(), ctx.directory.clone());
            info!("config: {}", ctx.config_path.display());
            DepotServer::new(state, addr)
                .with_max_body_mb(ctx.config.server.max_body_mb)
                .run()
                .await?;
        }
        Commands::InitRepo {
            owner,
            name,
            private,
        } => {
            let user = ctx
                .directory
                .user(&owner)
                .with_context(|| format!("Unknown user {}", owner))?;
            let repo = ctx.directory.create_repository(&user, &name, private).await?;

            let mut config = ctx.config.clone();
            config.repos.push(RepoConfig {
                owner: owner.clone(),
                name: repo.name.clone(),
                private,
            });
            config.save_to(&ctx.config_path)?;
            println!("Created {}/{} at {}", owner, repo.name, repo.prefix);
        }
        Commands::DeleteRepo { owner, name } => {
            let user = ctx
                .directory
                .user(&owner)
                .with_context(|| format!("Unknown user {}", owner))?;
            ctx.directory.remove_repository(&user, &name).await?;

            let bare = name.strip_suffix(".git").unwrap_or(&name);
            let mut config = ctx.config.clone();
            config.repos.retain(|r| !(r.owner == owner && r.name == bare));
            config.save_to(&ctx.config_path)?;
            println!("Deleted {}/{}", owner, bare);
        }
        Commands::Branches { owner, repo } => {
            let storage = ctx.repo_storage(&owner, &repo).await?;
            for branch in history::list_branches(&storage).await? {
                let marker = if branch.is_head { "*" } else { " " };
                println!("{} {} {}", marker, branch.oid, branch.name);
            }
        }
        Commands::Log {
            owner,
            repo,
            branch,
            limit,
        } => {
            let storage = ctx.repo_storage(&owner, &repo).await?;
            let tip = history::resolve_commitish(&storage, &branch).await?;
            for entry in history::log(&storage, tip, limit).await? {
                println!(
                    "{} {} <{}> {}",
                    entry.oid,
                    entry.commit.author.name,
                    entry.commit.author.email,
                    entry.commit.summary()
                );
            }
        }
        Commands::Cat {
            owner,
            repo,
            commitish,
            path,
        } => {
            let storage = ctx.repo_storage(&owner, &repo).await?;
            let content = history::read_file_at(&storage, &commitish, &path).await?;
            std::io::stdout().write_all(&content)?;
        }
    }

    Ok(())
}
