//! `become-replicator`: ask a node to start replicating a repo.
//!
//! The request is signed over the repo id and the signer must be able to
//! pull the repo. A node that accepts adds the repo to its allow-list and
//! announces itself under `replicate:<repo>`.

use std::sync::Arc;

use async_trait::async_trait;

use swarmgit_core::message::{BecomeReplicatorRequest, BecomeReplicatorResponse};
use swarmgit_core::wire::{read_message, write_message};
use swarmgit_core::{Keypair, Protocol};
use swarmgit_services::{AccessControl, BoxStream, ContentKey, Discovery, PeerId, Transport};

use super::authorize;
use super::replication::ReplicationPolicy;
use crate::dispatch::ProtocolHandler;

pub struct BecomeReplicatorServer {
    policy: Arc<ReplicationPolicy>,
    access: Arc<dyn AccessControl>,
    discovery: Arc<dyn Discovery>,
    local: PeerId,
}

impl BecomeReplicatorServer {
    pub fn new(
        policy: Arc<ReplicationPolicy>,
        access: Arc<dyn AccessControl>,
        discovery: Arc<dyn Discovery>,
        local: PeerId,
    ) -> Self {
        Self {
            policy,
            access,
            discovery,
            local,
        }
    }

    async fn decide(&self, peer: PeerId, req: &BecomeReplicatorRequest) -> Result<(), String> {
        if !self.policy.accepts_requests() {
            return Err("not accepting replication requests".into());
        }
        let authorized = authorize(
            self.access.as_ref(),
            peer,
            &req.repo_id,
            req.repo_id.as_bytes(),
            &req.signature,
        )
        .await;
        if authorized.is_none() {
            return Err(format!("not authorized to pull {}", req.repo_id));
        }
        if self.policy.allow(&req.repo_id) {
            self.discovery
                .announce(ContentKey::for_replicators(&req.repo_id), self.local);
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolHandler for BecomeReplicatorServer {
    fn protocol(&self) -> Protocol {
        Protocol::BecomeReplicator
    }

    async fn handle(&self, peer: PeerId, _protocol: Protocol, mut stream: BoxStream) -> anyhow::Result<()> {
        let req: BecomeReplicatorRequest = read_message(&mut stream).await?;
        let resp = match self.decide(peer, &req).await {
            Ok(()) => {
                tracing::info!(%peer, repo = %req.repo_id, "now replicating");
                BecomeReplicatorResponse {
                    accepted: true,
                    error: String::new(),
                }
            }
            Err(error) => {
                tracing::info!(%peer, repo = %req.repo_id, %error, "replicator request declined");
                BecomeReplicatorResponse {
                    accepted: false,
                    error,
                }
            }
        };
        write_message(&mut stream, &resp).await?;
        Ok(())
    }
}

/// Ask `peer` to replicate `repo_id`.
pub async fn become_replicator(
    transport: &dyn Transport,
    keypair: &Keypair,
    peer: PeerId,
    repo_id: &str,
) -> anyhow::Result<()> {
    let mut stream = transport.open_stream(peer, Protocol::BecomeReplicator).await?;
    let req = BecomeReplicatorRequest {
        repo_id: repo_id.to_string(),
        signature: keypair.sign_hash(repo_id.as_bytes()),
    };
    write_message(&mut stream, &req).await?;
    let resp: BecomeReplicatorResponse = read_message(&mut stream).await?;
    if !resp.accepted {
        anyhow::bail!("{peer} declined to replicate {repo_id}: {}", resp.error);
    }
    Ok(())
}
