//! `manifest/1.0`: the object list needed to materialize a commit.
//!
//! The request is signed over the commit id. The server answers with a
//! header and, when it both authorizes the requester and holds the commit,
//! streams one entry per object as the walk produces it, ending with a
//! terminal entry. A walk that fails part way ends with a terminal entry
//! carrying the error, and the client discards everything it received.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use swarmgit_core::message::{ManifestEntry, ManifestRequest, ManifestResponse};
use swarmgit_core::wire::{read_message, try_read_message, write_message};
use swarmgit_core::{
    CheckoutType, Keypair, ManifestObject, ManifestObjectSet, ObjectId, Protocol,
};
use swarmgit_services::{AccessControl, BoxStream, ManifestWalk, PeerConnection, PeerId, RepoSet};

use super::authorize;
use crate::dispatch::ProtocolHandler;
use crate::fetch::FetchError;

// ── Server ───────────────────────────────────────────────────────────────────

pub struct ManifestServer {
    repos: Arc<RepoSet>,
    access: Arc<dyn AccessControl>,
}

impl ManifestServer {
    pub fn new(repos: Arc<RepoSet>, access: Arc<dyn AccessControl>) -> Self {
        Self { repos, access }
    }

    async fn serve_one<S>(&self, peer: PeerId, stream: &mut S, req: ManifestRequest) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        let authorized = authorize(
            self.access.as_ref(),
            peer,
            &req.repo_id,
            req.commit.as_bytes(),
            &req.signature,
        )
        .await
        .is_some();
        let repo = self.repos.get(&req.repo_id);
        let has_commit = repo.as_ref().is_some_and(|r| r.has_object(&req.commit));

        write_message(stream, &ManifestResponse { authorized, has_commit }).await?;
        let repo = match repo {
            Some(repo) if authorized && has_commit => repo,
            _ => {
                tracing::debug!(%peer, repo = %req.repo_id, authorized, has_commit, "manifest refused");
                return Ok(());
            }
        };

        let mut sent = 0usize;
        for object in ManifestWalk::new(repo, req.commit, req.checkout_type) {
            match object {
                Ok(o) => {
                    write_message(stream, &ManifestEntry::object(&o.id, o.uncompressed_size)).await?;
                    sent += 1;
                }
                Err(e) => {
                    tracing::warn!(%peer, repo = %req.repo_id, commit = %req.commit, error = %e, "manifest walk failed");
                    write_message(stream, &ManifestEntry::failed(e.to_string())).await?;
                    return Ok(());
                }
            }
        }
        write_message(stream, &ManifestEntry::terminal()).await?;
        tracing::debug!(%peer, repo = %req.repo_id, commit = %req.commit, entries = sent, "manifest served");
        Ok(())
    }
}

#[async_trait]
impl ProtocolHandler for ManifestServer {
    fn protocol(&self) -> Protocol {
        Protocol::Manifest
    }

    async fn handle(&self, peer: PeerId, _protocol: Protocol, mut stream: BoxStream) -> anyhow::Result<()> {
        while let Some(req) = try_read_message::<_, ManifestRequest>(&mut stream).await? {
            self.serve_one(peer, &mut stream, req).await?;
        }
        Ok(())
    }
}

// ── Client ───────────────────────────────────────────────────────────────────

/// Fetch the manifest of `commit` from one peer.
pub async fn request_manifest(
    conn: &PeerConnection,
    keypair: &Keypair,
    commit: ObjectId,
    checkout: CheckoutType,
) -> Result<ManifestObjectSet, FetchError> {
    let mut stream = conn.open(Protocol::Manifest).await?;
    let req = ManifestRequest {
        repo_id: conn.repo_id().to_string(),
        commit,
        checkout_type: checkout,
        signature: keypair.sign_hash(commit.as_bytes()),
    };
    write_message(&mut stream, &req).await?;

    let header: ManifestResponse = read_message(&mut stream).await?;
    if !header.authorized {
        return Err(FetchError::Unauthorized(conn.repo_id().to_string()));
    }
    if !header.has_commit {
        return Err(FetchError::MissingCommit(commit));
    }

    let mut manifest = ManifestObjectSet::default();
    loop {
        let entry: ManifestEntry = read_message(&mut stream).await?;
        if entry.end {
            if !entry.error.is_empty() {
                return Err(FetchError::Protocol(format!(
                    "peer could not build manifest: {}",
                    entry.error
                )));
            }
            return Ok(manifest);
        }
        manifest.push(ManifestObject {
            id: ObjectId::from_bytes(&entry.id)?,
            uncompressed_size: entry.uncompressed_size,
        });
    }
}
