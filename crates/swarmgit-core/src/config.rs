//! Configuration system for Swarmgit.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SWARMGIT_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/swarmgit/config.toml
//!   3. ~/.config/swarmgit/config.toml

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// How long a batch may sit half-full before it is sent anyway.
/// Fixed; not read from the config file.
pub const BATCH_TIMEOUT: Duration = Duration::from_secs(3);

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmgitConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub fetch: FetchConfig,
    pub replication: ReplicationConfig,
    pub access: AccessConfig,
    /// Statically known peers. Seeds discovery and the TCP address book.
    pub peers: Vec<PeerConfig>,
    /// Published head commit per repo id, hex. Seeds the ref registry.
    pub heads: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the ed25519 signing key. Auto-generated on first run.
    pub keypair_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP address incoming streams are accepted on.
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// One repository per repo id lives under this directory.
    pub repos_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Peer connections held concurrently by one fetch stream.
    pub max_concurrent_peers: usize,
    /// How long to wait on discovery before giving up on a repo.
    pub find_provider_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Repo ids this node is willing to replicate.
    pub repos: Vec<String>,
    /// Refuse to replicate repos larger than this many bytes. 0 = no cap.
    pub max_bytes: u64,
    /// Honour become-replicator requests from other nodes.
    pub accept_requests: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// If true, any valid signer may pull any repo this node holds.
    pub open: bool,
    /// Explicit pull grants.
    pub grants: Vec<AccessGrant>,
    /// Where runtime grant changes are persisted. None = memory only.
    pub persist_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub repo: String,
    /// Hex address, with or without `0x`.
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer's verifying key, hex.
    pub id: String,
    /// TCP address the peer listens on.
    pub addr: String,
    /// Repos the peer is known to hold.
    #[serde(default)]
    pub repos: Vec<String>,
    /// Repos the peer replicates.
    #[serde(default)]
    pub replicates: Vec<String>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            keypair_path: config_dir().join("keypair"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7420".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            repos_root: data_dir().join("repos"),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_peers: 4,
            find_provider_timeout_secs: 10,
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            repos: Vec::new(),
            max_bytes: 0,
            accept_requests: false,
        }
    }
}

impl FetchConfig {
    pub fn find_provider_timeout(&self) -> Duration {
        Duration::from_secs(self.find_provider_timeout_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("swarmgit")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("swarmgit")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SwarmgitConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = Self::load_file(&path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse the file at `path`, or defaults if it does not exist. No env overrides.
    pub fn load_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(SwarmgitConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SWARMGIT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&SwarmgitConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply SWARMGIT_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("SWARMGIT_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Some(v) = var("SWARMGIT_STORAGE__REPOS_ROOT") {
            self.storage.repos_root = PathBuf::from(v);
        }
        if let Some(v) = var("SWARMGIT_FETCH__MAX_CONCURRENT_PEERS") {
            if let Ok(n) = v.parse::<usize>() {
                self.fetch.max_concurrent_peers = n.max(1);
            }
        }
        if let Some(v) = var("SWARMGIT_ACCESS__OPEN") {
            self.access.open = v == "true" || v == "1";
        }
        if let Some(v) = var("SWARMGIT_REPLICATION__ACCEPT_REQUESTS") {
            self.replication.accept_requests = v == "true" || v == "1";
        }
    }
}
