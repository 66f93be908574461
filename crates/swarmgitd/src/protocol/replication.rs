//! `replication/1.1`: ask replicators to pull a repo and watch them do it.
//!
//! The client finds peers announced under `replicate:<repo>`, opens one
//! stream per peer and sends a single request. Each peer answers with
//! progress records ending in `done` or an error. The client folds the
//! streams into one: the running maximum percentage, success as soon as any
//! peer is done, failure only when every peer failed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use futures::stream::{self, SelectAll, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

use swarmgit_core::config::ReplicationConfig;
use swarmgit_core::message::{Progress, ReplicationRequest};
use swarmgit_core::wire::{read_message, write_message};
use swarmgit_core::Protocol;
use swarmgit_services::{BoxStream, ContentKey, Discovery, PeerId, Shutdown, Transport};

use crate::dispatch::ProtocolHandler;
use crate::pull::Puller;

/// Progress records buffered between a pull and its stream.
const PROGRESS_QUEUE: usize = 32;

// ── Policy ───────────────────────────────────────────────────────────────────

/// Which repos this node replicates, and on what terms.
#[derive(Debug, Default)]
pub struct ReplicationPolicy {
    repos: DashSet<String>,
    max_bytes: u64,
    accept_requests: bool,
}

impl ReplicationPolicy {
    pub fn new(max_bytes: u64, accept_requests: bool) -> Self {
        Self {
            repos: DashSet::new(),
            max_bytes,
            accept_requests,
        }
    }

    pub fn from_config(config: &ReplicationConfig) -> Self {
        let policy = Self::new(config.max_bytes, config.accept_requests);
        for repo in &config.repos {
            policy.allow(repo);
        }
        policy
    }

    pub fn allows(&self, repo_id: &str) -> bool {
        self.repos.contains(repo_id)
    }

    /// Add `repo_id` to the allow-list. Returns false if it was already there.
    pub fn allow(&self, repo_id: &str) -> bool {
        self.repos.insert(repo_id.to_string())
    }

    /// Largest pull this node accepts, in bytes. 0 means no cap.
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn accepts_requests(&self) -> bool {
        self.accept_requests
    }

    pub fn repos(&self) -> Vec<String> {
        let mut repos: Vec<String> = self.repos.iter().map(|r| r.key().clone()).collect();
        repos.sort();
        repos
    }
}

// ── Server ───────────────────────────────────────────────────────────────────

pub struct ReplicationServer {
    policy: Arc<ReplicationPolicy>,
    puller: Arc<dyn Puller>,
}

impl ReplicationServer {
    pub fn new(policy: Arc<ReplicationPolicy>, puller: Arc<dyn Puller>) -> Self {
        Self { policy, puller }
    }
}

#[async_trait]
impl ProtocolHandler for ReplicationServer {
    fn protocol(&self) -> Protocol {
        Protocol::Replication
    }

    async fn handle(&self, peer: PeerId, _protocol: Protocol, mut stream: BoxStream) -> anyhow::Result<()> {
        let req: ReplicationRequest = read_message(&mut stream).await?;
        let repo_id = req.repo_id;
        if !self.policy.allows(&repo_id) {
            tracing::info!(%peer, repo = %repo_id, "replication refused: repo not on allow-list");
            write_message(&mut stream, &Progress::failed(format!("not replicating {repo_id}"))).await?;
            return Ok(());
        }

        tracing::info!(%peer, repo = %repo_id, "replication started");
        let (tx, mut rx) = mpsc::channel(PROGRESS_QUEUE);
        let puller = self.puller.clone();
        let pull_repo = repo_id.clone();
        let pull = tokio::spawn(async move { puller.pull(&pull_repo, tx).await });

        let mut total = 0;
        while let Some(p) = rx.recv().await {
            total = p.total;
            if let Err(e) = write_message(&mut stream, &Progress::tick(p.current, p.total)).await {
                // requester went away; nobody is waiting for the result
                pull.abort();
                return Err(e.into());
            }
        }

        let last = match pull.await {
            Ok(Ok(())) => {
                tracing::info!(%peer, repo = %repo_id, bytes = total, "replication finished");
                Progress::done(total)
            }
            Ok(Err(e)) => {
                tracing::warn!(%peer, repo = %repo_id, error = %e, "replication failed");
                Progress::failed(e.to_string())
            }
            Err(e) => {
                tracing::error!(%peer, repo = %repo_id, error = %e, "pull task died");
                Progress::failed("pull task died")
            }
        };
        write_message(&mut stream, &last).await?;
        Ok(())
    }
}

// ── Client ───────────────────────────────────────────────────────────────────

type PeerFeed = stream::BoxStream<'static, (PeerId, Progress)>;

enum FeedState {
    Connect,
    Streaming(BoxStream),
}

/// Drives replication of a repo across the replicators discovery knows of.
#[derive(Clone)]
pub struct Replicator {
    transport: Arc<dyn Transport>,
    discovery: Arc<dyn Discovery>,
    max_peers: usize,
    find_timeout: Duration,
}

impl Replicator {
    pub fn new(
        transport: Arc<dyn Transport>,
        discovery: Arc<dyn Discovery>,
        max_peers: usize,
        find_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            discovery,
            max_peers: max_peers.max(1),
            find_timeout,
        }
    }

    /// Start replicating `repo_id`.
    ///
    /// The returned channel carries non-decreasing percentages as
    /// `Progress::tick(pct, 100)` and ends with exactly one terminal record.
    /// Dropping it, or triggering `shutdown`, abandons every replicator
    /// stream.
    pub fn replicate(&self, repo_id: &str, shutdown: &Shutdown) -> mpsc::Receiver<Progress> {
        let (tx, rx) = mpsc::channel(PROGRESS_QUEUE);
        let this = self.clone();
        let repo_id = repo_id.to_string();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let last = this.run(&repo_id, &tx, &shutdown).await;
            if let Some(last) = last {
                let _ = tx.send(last).await;
            }
        });
        rx
    }

    async fn run(&self, repo_id: &str, out: &mpsc::Sender<Progress>, shutdown: &Shutdown) -> Option<Progress> {
        let peers = tokio::select! {
            _ = shutdown.cancelled() => return Some(Progress::failed("replication cancelled")),
            peers = self.discover(repo_id) => peers,
        };
        if peers.is_empty() {
            tracing::warn!(repo = %repo_id, "no replicators found");
            return Some(Progress::failed(format!("could not find replicator for repo {repo_id}")));
        }
        tracing::info!(repo = %repo_id, replicators = peers.len(), "requesting replication");

        let feeds: SelectAll<PeerFeed> = stream::select_all(
            peers
                .into_iter()
                .map(|peer| peer_feed(self.transport.clone(), peer, repo_id.to_string())),
        );
        combine(feeds, out, shutdown).await
    }

    async fn discover(&self, repo_id: &str) -> Vec<PeerId> {
        let local = self.transport.local_peer();
        let mut found = self
            .discovery
            .find_providers(ContentKey::for_replicators(repo_id), 0);
        let deadline = Instant::now() + self.find_timeout;
        let mut peers = Vec::new();
        while peers.len() < self.max_peers {
            match tokio::time::timeout_at(deadline, found.recv()).await {
                Ok(Some(peer)) if peer != local && !peers.contains(&peer) => peers.push(peer),
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
        peers
    }
}

/// Fold per-peer progress into one stream. Returns the terminal record, or
/// None if the consumer went away.
async fn combine(mut feeds: SelectAll<PeerFeed>, out: &mpsc::Sender<Progress>, shutdown: &Shutdown) -> Option<Progress> {
    let mut best = 0u8;
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return Some(Progress::failed("replication cancelled")),
            next = feeds.next() => next,
        };
        let Some((peer, progress)) = next else {
            return Some(Progress::failed("every replicator failed"));
        };
        if progress.done {
            tracing::info!(%peer, "replicator finished");
            return Some(Progress::done(100));
        }
        if progress.is_error() {
            tracing::warn!(%peer, error = %progress.error, "replicator failed");
            continue;
        }
        let pct = progress.percent();
        if pct > best {
            best = pct;
            out.send(Progress::tick(u64::from(best), 100)).await.ok()?;
        }
    }
}

/// Progress records from one replicator. Always ends with a terminal record.
fn peer_feed(transport: Arc<dyn Transport>, peer: PeerId, repo_id: String) -> PeerFeed {
    stream::unfold(Some(FeedState::Connect), move |state| {
        let transport = transport.clone();
        let repo_id = repo_id.clone();
        async move {
            let mut stream = match state? {
                FeedState::Connect => match open_replication(transport.as_ref(), peer, &repo_id).await {
                    Ok(s) => s,
                    Err(e) => return Some(((peer, Progress::failed(e.to_string())), None)),
                },
                FeedState::Streaming(s) => s,
            };
            match read_message::<_, Progress>(&mut stream).await {
                Ok(p) if p.is_terminal() => Some(((peer, p), None)),
                Ok(p) => Some(((peer, p), Some(FeedState::Streaming(stream)))),
                Err(e) => Some(((peer, Progress::failed(e.to_string())), None)),
            }
        }
    })
    .boxed()
}

async fn open_replication(transport: &dyn Transport, peer: PeerId, repo_id: &str) -> anyhow::Result<BoxStream> {
    let mut stream = transport.open_stream(peer, Protocol::Replication).await?;
    let req = ReplicationRequest {
        repo_id: repo_id.to_string(),
    };
    write_message(&mut stream, &req).await?;
    Ok(stream)
}
