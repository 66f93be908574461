//! A swarm node: the protocol servers plus client helpers over one identity.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use swarmgit_core::message::Progress;
use swarmgit_core::{CheckoutType, Keypair, ObjectId, Protocol};
use swarmgit_services::{
    AccessControl, ContentKey, Discovery, IncomingStream, PeerConnection, PeerId, RefRegistry,
    RepoSet, Shutdown, Transport,
};

use crate::dispatch::{ProtocolDispatcher, ProtocolHandler};
use crate::fetch::{FetchError, FetchSettings, Fetcher};
use crate::ingest::{ingest, IngestReport};
use crate::protocol::become_replicator::{become_replicator, BecomeReplicatorServer};
use crate::protocol::chunk::{request_object, ObjectServer};
use crate::protocol::manifest::ManifestServer;
use crate::protocol::packfile::PackfileServer;
use crate::protocol::replication::{ReplicationPolicy, ReplicationServer, Replicator};
use crate::pull::{Puller, SwarmPuller};

/// Everything a node is assembled from.
pub struct NodeParts {
    pub keypair: Arc<Keypair>,
    pub transport: Arc<dyn Transport>,
    pub discovery: Arc<dyn Discovery>,
    pub repos: Arc<RepoSet>,
    pub access: Arc<dyn AccessControl>,
    pub refs: Arc<dyn RefRegistry>,
    pub policy: Arc<ReplicationPolicy>,
    pub settings: FetchSettings,
    pub shutdown: Shutdown,
}

pub struct Node {
    keypair: Arc<Keypair>,
    transport: Arc<dyn Transport>,
    discovery: Arc<dyn Discovery>,
    repos: Arc<RepoSet>,
    access: Arc<dyn AccessControl>,
    policy: Arc<ReplicationPolicy>,
    fetcher: Fetcher,
    puller: Arc<dyn Puller>,
    shutdown: Shutdown,
}

impl Node {
    pub fn new(parts: NodeParts) -> Self {
        let NodeParts {
            keypair,
            transport,
            discovery,
            repos,
            access,
            refs,
            policy,
            settings,
            shutdown,
        } = parts;
        let fetcher = Fetcher::new(keypair.clone(), discovery.clone(), transport.clone(), settings);
        let puller = Arc::new(SwarmPuller::new(
            fetcher.clone(),
            repos.clone(),
            refs,
            discovery.clone(),
            transport.local_peer(),
            policy.max_bytes(),
            shutdown.clone(),
        ));
        Self {
            keypair,
            transport,
            discovery,
            repos,
            access,
            policy,
            fetcher,
            puller,
            shutdown,
        }
    }

    /// Replace how this node pulls repos it replicates.
    pub fn set_puller(&mut self, puller: Arc<dyn Puller>) {
        self.puller = puller;
    }

    pub fn peer_id(&self) -> PeerId {
        self.transport.local_peer()
    }

    pub fn repos(&self) -> &Arc<RepoSet> {
        &self.repos
    }

    pub fn policy(&self) -> &Arc<ReplicationPolicy> {
        &self.policy
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// A dispatcher serving every protocol.
    pub fn dispatcher(&self) -> ProtocolDispatcher {
        let mut d = ProtocolDispatcher::new();
        d.register(Arc::new(ManifestServer::new(self.repos.clone(), self.access.clone())));
        d.register(Arc::new(PackfileServer::new(self.repos.clone(), self.access.clone())));

        let objects: Arc<dyn ProtocolHandler> =
            Arc::new(ObjectServer::new(self.repos.clone(), self.access.clone()));
        d.register(objects.clone());
        d.register_as(Protocol::Object, objects);

        d.register(Arc::new(ReplicationServer::new(self.policy.clone(), self.puller.clone())));
        d.register(Arc::new(BecomeReplicatorServer::new(
            self.policy.clone(),
            self.access.clone(),
            self.discovery.clone(),
            self.peer_id(),
        )));
        d
    }

    /// Serve incoming streams until shutdown or until the transport closes.
    pub async fn serve(&self, mut incoming: mpsc::Receiver<IncomingStream>) {
        let dispatcher = self.dispatcher();
        tracing::info!(peer = %self.peer_id(), "serving");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("node shutting down");
                    break;
                }
                next = incoming.recv() => {
                    let Some(stream) = next else {
                        tracing::info!("transport closed");
                        break;
                    };
                    dispatcher.dispatch(stream);
                }
            }
        }
    }

    /// Announce every local repo, and every repo this node replicates.
    pub fn announce_local_repos(&self) {
        let me = self.peer_id();
        for repo in self.repos.ids() {
            self.discovery.announce(ContentKey::for_repo(&repo), me);
        }
        for repo in self.policy.repos() {
            self.discovery.announce(ContentKey::for_replicators(&repo), me);
        }
    }

    /// Fetch `commit` of `repo_id` into the local copy of the repo.
    pub async fn fetch(
        &self,
        repo_id: &str,
        commit: ObjectId,
        checkout: CheckoutType,
    ) -> Result<IngestReport, FetchError> {
        let repo = self.repos.get_or_open(repo_id)?;
        let op = self.shutdown.child();
        let mut stream = self
            .fetcher
            .fetch_from_commit(repo_id, commit, checkout, Some(repo.clone()), &op)
            .await?;
        let report = ingest(repo.as_ref(), &mut stream, None).await?;
        self.discovery.announce(ContentKey::for_repo(repo_id), self.peer_id());
        Ok(report)
    }

    /// Ask the swarm's replicators to pull `repo_id`.
    pub fn replicate(&self, repo_id: &str) -> mpsc::Receiver<Progress> {
        let settings = self.fetcher.settings();
        Replicator::new(
            self.transport.clone(),
            self.discovery.clone(),
            settings.max_concurrent_peers,
            settings.find_provider_timeout,
        )
        .replicate(repo_id, &self.shutdown)
    }

    pub async fn become_replicator(&self, peer: PeerId, repo_id: &str) -> anyhow::Result<()> {
        become_replicator(self.transport.as_ref(), &self.keypair, peer, repo_id).await
    }

    /// Fetch one versioned object straight from `peer`.
    pub async fn request_object(
        &self,
        peer: PeerId,
        repo_id: &str,
        id: ObjectId,
    ) -> Result<Option<Bytes>, FetchError> {
        let conn = PeerConnection::new(peer, repo_id, self.transport.clone());
        request_object(&conn, &self.keypair, id).await
    }
}
