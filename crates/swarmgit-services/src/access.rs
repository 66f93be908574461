//! Pull access control.
//!
//! Every privileged request names a repo and carries a signature. The
//! protocol servers recover the signer's [`Address`] and ask an
//! [`AccessControl`] whether that address may pull the repo. Nothing is
//! served before the answer is yes.
//!
//! [`AccessRegistry`] is the local implementation: an open mode in which
//! every valid signer may pull, plus explicit per-repo grants.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use swarmgit_core::config::AccessConfig;
use swarmgit_core::Address;

#[async_trait]
pub trait AccessControl: Send + Sync {
    /// Whether `address` may pull `repo_id`. An `Err` is treated as "no".
    async fn address_has_pull_access(&self, address: &Address, repo_id: &str)
        -> anyhow::Result<bool>;
}

/// Registry of pull grants.
///
/// When constructed with a persist path, grants are written to disk on every
/// mutation and reloaded on startup, so runtime changes survive restarts.
#[derive(Clone)]
pub struct AccessRegistry {
    grants: Arc<DashMap<String, HashSet<Address>>>,
    open: Arc<AtomicBool>,
    persist_path: Arc<Option<PathBuf>>,
}

impl Default for AccessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessRegistry {
    pub fn new() -> Self {
        Self {
            grants: Arc::new(DashMap::new()),
            open: Arc::new(AtomicBool::new(false)),
            persist_path: Arc::new(None),
        }
    }

    /// Create a registry that persists grants to the given file path.
    /// Loads existing grants from disk if the file exists.
    pub fn with_persistence(path: PathBuf) -> Self {
        let registry = Self {
            persist_path: Arc::new(Some(path)),
            ..Self::new()
        };
        registry.load_from_disk();
        registry
    }

    /// Build from config: persistence, open mode, then config grants on top.
    pub fn from_config(config: &AccessConfig) -> Self {
        let registry = match &config.persist_path {
            Some(path) => Self::with_persistence(path.clone()),
            None => Self::new(),
        };
        registry.set_open(config.open);
        for grant in &config.grants {
            match Address::from_hex(&grant.address) {
                // Config-sourced grants are not re-persisted
                Ok(addr) => {
                    registry
                        .grants
                        .entry(grant.repo.clone())
                        .or_default()
                        .insert(addr);
                }
                Err(e) => tracing::warn!(repo = %grant.repo, error = %e, "ignoring bad grant"),
            }
        }
        if config.open {
            tracing::warn!("open access enabled, any signer may pull any repo");
        }
        registry
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::Relaxed);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    pub fn grant(&self, repo_id: &str, address: Address) {
        self.grants
            .entry(repo_id.to_string())
            .or_default()
            .insert(address);
        self.save_to_disk();
        tracing::info!(repo = repo_id, %address, "pull access granted");
    }

    pub fn revoke(&self, repo_id: &str, address: &Address) {
        if let Some(mut set) = self.grants.get_mut(repo_id) {
            set.remove(address);
        }
        self.grants.remove_if(repo_id, |_, set| set.is_empty());
        self.save_to_disk();
        tracing::info!(repo = repo_id, %address, "pull access revoked");
    }

    pub fn has_grant(&self, repo_id: &str, address: &Address) -> bool {
        self.grants
            .get(repo_id)
            .map(|set| set.contains(address))
            .unwrap_or(false)
    }

    /// Addresses granted on `repo_id`, sorted.
    pub fn list(&self, repo_id: &str) -> Vec<Address> {
        self.grants
            .get(repo_id)
            .map(|set| set.iter().copied().collect::<BTreeSet<_>>().into_iter().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AccessControl for AccessRegistry {
    async fn address_has_pull_access(
        &self,
        address: &Address,
        repo_id: &str,
    ) -> anyhow::Result<bool> {
        Ok(self.is_open() || self.has_grant(repo_id, address))
    }
}

impl AccessRegistry {
    /// Serialize all grants to disk as JSON. Best-effort, logs on failure.
    fn save_to_disk(&self) {
        let Some(path) = self.persist_path.as_ref() else {
            return;
        };
        let snapshot: HashMap<String, Vec<String>> = self
            .grants
            .iter()
            .map(|entry| {
                let mut addrs: Vec<String> = entry.value().iter().map(|a| a.to_string()).collect();
                addrs.sort();
                (entry.key().clone(), addrs)
            })
            .collect();
        match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    tracing::warn!(error = %e, path = %path.display(), "failed to persist access grants");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize access grants");
            }
        }
    }

    /// Load grants from disk. Called once during construction.
    fn load_from_disk(&self) {
        let Some(path) = self.persist_path.as_ref() else {
            return;
        };
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to read access grants");
                return;
            }
        };
        let map: HashMap<String, Vec<String>> = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to parse access grants");
                return;
            }
        };
        let mut loaded = 0usize;
        for (repo, addrs) in map {
            let mut set = self.grants.entry(repo).or_default();
            for addr in addrs.iter().filter_map(|a| Address::from_hex(a).ok()) {
                set.insert(addr);
                loaded += 1;
            }
        }
        if loaded > 0 {
            tracing::info!(count = loaded, path = %path.display(), "loaded persisted access grants");
        }
    }
}
