//! Peer discovery by content key.
//!
//! A repo is discoverable under two keys: one for peers that hold it and one
//! (`replicate:<repo>`) for peers willing to replicate it. [`Discovery`] is
//! the seam; [`StaticDiscovery`] is an in-memory provider table seeded from
//! config and from announcements.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::transport::PeerId;

/// Discovery key derived from a repo id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentKey(pub [u8; 32]);

impl ContentKey {
    /// Key under which holders of `repo_id` announce.
    pub fn for_repo(repo_id: &str) -> Self {
        ContentKey(*blake3::hash(repo_id.as_bytes()).as_bytes())
    }

    /// Key under which replicators of `repo_id` announce.
    pub fn for_replicators(repo_id: &str) -> Self {
        Self::for_repo(&format!("replicate:{repo_id}"))
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentKey({})", &hex::encode(self.0)[..12])
    }
}

pub trait Discovery: Send + Sync {
    /// Stream up to `limit` providers of `key` (0 = no limit).
    ///
    /// The receiver closes when this query is exhausted; callers that want
    /// more issue a new query.
    fn find_providers(&self, key: ContentKey, limit: usize) -> mpsc::Receiver<PeerId>;

    /// Record `peer` as a provider of `key`.
    fn announce(&self, key: ContentKey, peer: PeerId);
}

/// In-memory provider table. Clones share the same table.
#[derive(Clone, Default)]
pub struct StaticDiscovery {
    providers: Arc<DashMap<ContentKey, Vec<PeerId>>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop `peer` from every key.
    pub fn forget(&self, peer: &PeerId) {
        for mut entry in self.providers.iter_mut() {
            entry.value_mut().retain(|p| p != peer);
        }
    }

    pub fn providers(&self, key: &ContentKey) -> Vec<PeerId> {
        self.providers
            .get(key)
            .map(|p| p.value().clone())
            .unwrap_or_default()
    }
}

impl Discovery for StaticDiscovery {
    fn find_providers(&self, key: ContentKey, limit: usize) -> mpsc::Receiver<PeerId> {
        let mut peers = self.providers(&key);
        if limit > 0 {
            peers.truncate(limit);
        }
        let (tx, rx) = mpsc::channel(peers.len().max(1));
        for peer in peers {
            // capacity matches the list, so this cannot fail
            let _ = tx.try_send(peer);
        }
        rx
    }

    fn announce(&self, key: ContentKey, peer: PeerId) {
        let mut entry = self.providers.entry(key).or_default();
        if !entry.contains(&peer) {
            entry.push(peer);
            tracing::debug!(?key, %peer, "provider announced");
        }
    }
}
