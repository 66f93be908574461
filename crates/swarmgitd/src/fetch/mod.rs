//! Fetch from commit: pull the objects behind one commit from the swarm.
//!
//! A manifest comes from the first peer that holds the commit and authorizes
//! us. Objects we already have are dropped. The rest splits into versioned
//! objects (fetched in packfile batches) and chunks (fetched one by one),
//! and each half runs through its own scheduler and peer pool. Both halves
//! write into one bounded packet channel; the stream ends when both finish,
//! or after a single [`Packet::Error`].

mod driver;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use swarmgit_core::config::{FetchConfig, BATCH_TIMEOUT};
use swarmgit_core::{CheckoutType, Keypair, ManifestObjectSet, ObjectId, WireError};
use swarmgit_services::{
    Discovery, PackError, PeerPool, RepoError, Repository, Shutdown, Transport, TransportError,
};

use crate::protocol::chunk::ChunkLane;
use crate::protocol::manifest::request_manifest;
use crate::protocol::packfile::PackfileLane;

pub(crate) use driver::{Lane, Outcome};

/// Packets in flight between the lanes and their consumer.
const PACKET_QUEUE: usize = 64;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("not authorized to pull {0}")]
    Unauthorized(String),

    #[error("could not find provider for repo {0}")]
    NoProviders(String),

    #[error("no provider holds commit {0}")]
    MissingCommit(ObjectId),

    #[error("objects unavailable: {0}")]
    Unavailable(String),

    #[error("transport failed: {0}")]
    Transport(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("storage failed: {0}")]
    Storage(String),

    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Failures that mean the peer itself is at fault and should be replaced.
    pub fn strikes_peer(&self) -> bool {
        matches!(
            self,
            FetchError::Unauthorized(_) | FetchError::Transport(_) | FetchError::Protocol(_)
        )
    }
}

impl From<WireError> for FetchError {
    fn from(e: WireError) -> Self {
        if e.is_transport() {
            FetchError::Transport(e.to_string())
        } else {
            FetchError::Protocol(e.to_string())
        }
    }
}

impl From<TransportError> for FetchError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Handshake(w) => w.into(),
            other => FetchError::Transport(other.to_string()),
        }
    }
}

impl From<RepoError> for FetchError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::Corrupt { .. } => FetchError::Protocol(e.to_string()),
            other => FetchError::Storage(other.to_string()),
        }
    }
}

impl From<PackError> for FetchError {
    fn from(e: PackError) -> Self {
        match e {
            PackError::Repo(r) => r.into(),
            other => FetchError::Protocol(other.to_string()),
        }
    }
}

// ── Packets ──────────────────────────────────────────────────────────────────

/// Output of a fetch.
///
/// Frames of one packfile or chunk arrive in order; frames of different
/// transfers interleave freely, so consumers key them by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    PackfileHeader {
        packfile_id: [u8; 32],
        uncompressed_size: u64,
    },
    PackfileData {
        packfile_id: [u8; 32],
        data: Bytes,
        end: bool,
    },
    /// The transfer behind a header died before its end frame; frames
    /// already sent for it are void.
    PackfileAborted { packfile_id: [u8; 32] },
    ChunkData {
        object_id: ObjectId,
        data: Bytes,
        end: bool,
    },
    Error(FetchError),
}

// ── Fetcher ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub max_concurrent_peers: usize,
    pub find_provider_timeout: Duration,
    pub batch_timeout: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        (&FetchConfig::default()).into()
    }
}

impl From<&FetchConfig> for FetchSettings {
    fn from(c: &FetchConfig) -> Self {
        Self {
            max_concurrent_peers: c.max_concurrent_peers.max(1),
            find_provider_timeout: c.find_provider_timeout(),
            batch_timeout: BATCH_TIMEOUT,
        }
    }
}

/// Client side of a fetch. Cheap to clone.
#[derive(Clone)]
pub struct Fetcher {
    keypair: Arc<Keypair>,
    discovery: Arc<dyn Discovery>,
    transport: Arc<dyn Transport>,
    settings: FetchSettings,
}

impl Fetcher {
    pub fn new(
        keypair: Arc<Keypair>,
        discovery: Arc<dyn Discovery>,
        transport: Arc<dyn Transport>,
        settings: FetchSettings,
    ) -> Self {
        Self {
            keypair,
            discovery,
            transport,
            settings,
        }
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    /// Ask providers of `repo_id` for the manifest of `commit`, one at a time,
    /// until one answers.
    pub async fn fetch_manifest(
        &self,
        repo_id: &str,
        commit: ObjectId,
        checkout: CheckoutType,
        shutdown: &Shutdown,
    ) -> Result<ManifestObjectSet, FetchError> {
        let pool = PeerPool::new(
            repo_id,
            1,
            self.settings.find_provider_timeout,
            self.discovery.clone(),
            self.transport.clone(),
            shutdown,
        );

        let mut refused = false;
        let mut missing = false;
        let mut last_error = None;
        while let Some(conn) = pool.get_conn().await {
            match request_manifest(&conn, &self.keypair, commit, checkout).await {
                Ok(manifest) => {
                    tracing::debug!(
                        repo = %repo_id,
                        peer = %conn.peer(),
                        git = manifest.git_objects.len(),
                        chunks = manifest.chunk_objects.len(),
                        "manifest received"
                    );
                    pool.return_conn(conn, false);
                    pool.close().await;
                    return Ok(manifest);
                }
                Err(FetchError::Unauthorized(_)) => refused = true,
                Err(FetchError::MissingCommit(_)) => missing = true,
                Err(e) => {
                    tracing::warn!(repo = %repo_id, peer = %conn.peer(), error = %e, "manifest request failed");
                    last_error = Some(e);
                }
            }
            pool.return_conn(conn, true);
        }
        pool.close().await;

        Err(if shutdown.is_triggered() {
            FetchError::Cancelled
        } else if missing {
            FetchError::MissingCommit(commit)
        } else if refused {
            FetchError::Unauthorized(repo_id.to_string())
        } else {
            last_error.unwrap_or_else(|| FetchError::NoProviders(repo_id.to_string()))
        })
    }

    /// Fetch every object needed to materialize `commit` that `local` lacks.
    ///
    /// Returns once the manifest is known; objects then arrive on the
    /// returned stream. Dropping the stream cancels the fetch.
    pub async fn fetch_from_commit(
        &self,
        repo_id: &str,
        commit: ObjectId,
        checkout: CheckoutType,
        local: Option<Arc<dyn Repository>>,
        shutdown: &Shutdown,
    ) -> Result<FetchStream, FetchError> {
        let mut manifest = self
            .fetch_manifest(repo_id, commit, checkout, shutdown)
            .await?;
        if let Some(local) = &local {
            manifest.retain(|o| !local.has_object(&o.id));
        }
        tracing::info!(
            repo = %repo_id,
            %commit,
            git = manifest.git_objects.len(),
            chunks = manifest.chunk_objects.len(),
            bytes = manifest.uncompressed_size(),
            "fetching objects"
        );

        let op = shutdown.child();
        let (tx, rx) = mpsc::channel(PACKET_QUEUE);

        let git_lane: Arc<dyn Lane> = Arc::new(PackfileLane::new(self.keypair.clone()));
        let chunk_lane: Arc<dyn Lane> = Arc::new(ChunkLane::new(self.keypair.clone()));
        for (lane, objects) in [
            (git_lane, manifest.git_objects.clone()),
            (chunk_lane, manifest.chunk_objects.clone()),
        ] {
            let run = driver::LaneRun {
                lane,
                repo_id: repo_id.to_string(),
                objects,
                settings: self.settings.clone(),
                discovery: self.discovery.clone(),
                transport: self.transport.clone(),
                out: tx.clone(),
            };
            let op = op.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let name = run.lane.name();
                match run.drive(&op).await {
                    Ok(()) => tracing::debug!(lane = name, "lane finished"),
                    Err(FetchError::Cancelled) => tracing::debug!(lane = name, "lane cancelled"),
                    Err(e) => {
                        tracing::error!(lane = name, error = %e, "lane failed");
                        op.trigger();
                        let _ = tx.send(Packet::Error(e)).await;
                    }
                }
            });
        }

        Ok(FetchStream {
            manifest,
            packets: rx,
            shutdown: op,
        })
    }
}

/// Packets of one running fetch.
pub struct FetchStream {
    manifest: ManifestObjectSet,
    packets: mpsc::Receiver<Packet>,
    shutdown: Shutdown,
}

impl FetchStream {
    #[cfg(test)]
    pub(crate) fn from_parts(
        manifest: ManifestObjectSet,
        packets: mpsc::Receiver<Packet>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            manifest,
            packets,
            shutdown,
        }
    }

    /// The objects this fetch will deliver.
    pub fn manifest(&self) -> &ManifestObjectSet {
        &self.manifest
    }

    /// Next packet, or None once both lanes have finished.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.packets.recv().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_triggered()
    }
}

impl Drop for FetchStream {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}
