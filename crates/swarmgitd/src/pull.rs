//! Pulling a whole repo from the swarm, as a replicator does.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use swarmgit_core::message::Progress;
use swarmgit_core::CheckoutType;
use swarmgit_services::{ContentKey, Discovery, PeerId, RefRegistry, RepoSet, Shutdown};

use crate::fetch::Fetcher;
use crate::ingest::ingest;

/// Brings a local copy of a repo up to date with its upstream.
#[async_trait]
pub trait Puller: Send + Sync {
    /// Pull `repo_id`, sending progress ticks (never terminal records) on
    /// `progress` as it goes.
    async fn pull(&self, repo_id: &str, progress: mpsc::Sender<Progress>) -> anyhow::Result<()>;
}

/// Pulls the registered HEAD of a repo from whichever peers hold it.
pub struct SwarmPuller {
    fetcher: Fetcher,
    repos: Arc<RepoSet>,
    refs: Arc<dyn RefRegistry>,
    discovery: Arc<dyn Discovery>,
    local: PeerId,
    max_bytes: u64,
    shutdown: Shutdown,
}

impl SwarmPuller {
    pub fn new(
        fetcher: Fetcher,
        repos: Arc<RepoSet>,
        refs: Arc<dyn RefRegistry>,
        discovery: Arc<dyn Discovery>,
        local: PeerId,
        max_bytes: u64,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            fetcher,
            repos,
            refs,
            discovery,
            local,
            max_bytes,
            shutdown,
        }
    }
}

#[async_trait]
impl Puller for SwarmPuller {
    async fn pull(&self, repo_id: &str, progress: mpsc::Sender<Progress>) -> anyhow::Result<()> {
        let head = self
            .refs
            .head(repo_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no HEAD registered for {repo_id}"))?;
        let repo = self.repos.get_or_open(repo_id)?;

        let op = self.shutdown.child();
        let mut stream = self
            .fetcher
            .fetch_from_commit(repo_id, head, CheckoutType::Full, Some(repo.clone()), &op)
            .await?;

        let size = stream.manifest().uncompressed_size();
        if self.max_bytes > 0 && size > self.max_bytes {
            anyhow::bail!(
                "{repo_id} needs {size} bytes, over the replication cap of {}",
                self.max_bytes
            );
        }

        let report = ingest(repo.as_ref(), &mut stream, Some(&progress)).await?;
        self.discovery.announce(ContentKey::for_repo(repo_id), self.local);
        tracing::info!(
            repo = %repo_id,
            %head,
            objects = report.objects,
            chunks = report.chunks,
            bytes = report.bytes,
            "repo pulled"
        );
        Ok(())
    }
}
