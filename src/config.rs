use anyhow::{Context, Result};
use depot_store::CachePolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub users: Vec<UserConfig>,
    #[serde(default)]
    pub repos: Vec<RepoConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Largest accepted request body (pushes), in MiB
    #[serde(default = "default_max_body_mb")]
    pub max_body_mb: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Memory,
    Lmdb,
    S3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: Backend,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Settings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Settings {
    pub bucket: String,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible services (MinIO, R2)
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: u64,
    /// Cross-request lifetime of refs and HEAD (0 = never cached)
    #[serde(default)]
    pub mutable_ttl_ms: u64,
    #[serde(default = "default_listing_ttl_ms")]
    pub listing_ttl_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub session_tokens: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Owner username
    pub owner: String,
    pub name: String,
    #[serde(default)]
    pub private: bool,
}

fn default_bind_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_body_mb() -> usize {
    512
}

fn default_backend() -> Backend {
    Backend::Lmdb
}

fn default_data_dir() -> String {
    get_depot_dir()
        .join("data")
        .to_string_lossy()
        .to_string()
}

fn default_cache_max_entries() -> usize {
    100_000
}

fn default_cache_max_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_listing_ttl_ms() -> u64 {
    1000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            max_body_mb: default_max_body_mb(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            data_dir: default_data_dir(),
            s3: None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
            max_bytes: default_cache_max_bytes(),
            mutable_ttl_ms: 0,
            listing_ttl_ms: default_listing_ttl_ms(),
        }
    }
}

impl CacheConfig {
    pub fn to_policy(&self) -> CachePolicy {
        CachePolicy {
            max_entries: self.max_entries,
            max_bytes: self.max_bytes,
            mutable_ttl: Duration::from_millis(self.mutable_ttl_ms),
            listing_ttl: Duration::from_millis(self.listing_ttl_ms),
        }
    }
}

impl Config {
    /// Load config from the default path, or create it with defaults
    pub fn load() -> Result<Self> {
        Self::load_from(&get_config_path())
    }

    /// Load config from `path`, creating a default file if it doesn't exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;

        Ok(())
    }
}

/// Get the depot directory (~/.depot)
pub fn get_depot_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".depot")
}

/// Get the config file path (~/.depot/config.toml)
pub fn get_config_path() -> PathBuf {
    get_depot_dir().join("config.toml")
}
