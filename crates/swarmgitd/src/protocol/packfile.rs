//! `packfile/1.0`: batches of versioned objects, packed on demand.
//!
//! Each cycle on a stream is: request (signed over the repo id) → response
//! listing the requested objects the server will pack → data frames ending
//! with a sentinel, unless the list is empty. A stream carries any number
//! of cycles; the client closing its side ends it.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use swarmgit_core::message::{DataFrame, PackfileRequest, PackfileResponse};
use swarmgit_core::wire::{read_message, try_read_message, write_message};
use swarmgit_core::{Keypair, ObjectId, Protocol};
use swarmgit_services::{
    pack_id, AccessControl, BoxStream, Job, PackBuilder, PeerConnection, PeerId, RepoSet,
};

use super::{authorize, write_frames};
use crate::dispatch::ProtocolHandler;
use crate::fetch::{FetchError, Lane, Outcome, Packet};

// ── Server ───────────────────────────────────────────────────────────────────

pub struct PackfileServer {
    repos: Arc<RepoSet>,
    access: Arc<dyn AccessControl>,
}

impl PackfileServer {
    pub fn new(repos: Arc<RepoSet>, access: Arc<dyn AccessControl>) -> Self {
        Self { repos, access }
    }

    async fn serve_one<S>(&self, peer: PeerId, stream: &mut S, req: PackfileRequest) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        let authorized = authorize(
            self.access.as_ref(),
            peer,
            &req.repo_id,
            req.repo_id.as_bytes(),
            &req.signature,
        )
        .await
        .is_some();
        if !authorized {
            write_message(stream, &PackfileResponse { authorized, available: vec![] }).await?;
            return Ok(());
        }

        let available: Vec<ObjectId> = match self.repos.get(&req.repo_id) {
            Some(repo) => req
                .object_ids
                .iter()
                .filter(|id| !id.is_chunk() && repo.has_object(id))
                .copied()
                .collect(),
            None => vec![],
        };
        write_message(
            stream,
            &PackfileResponse {
                authorized,
                available: available.clone(),
            },
        )
        .await?;
        if available.is_empty() {
            tracing::debug!(%peer, repo = %req.repo_id, requested = req.object_ids.len(), "nothing to pack");
            return Ok(());
        }

        let repo = self
            .repos
            .get(&req.repo_id)
            .ok_or_else(|| anyhow::anyhow!("repo {} vanished mid-request", req.repo_id))?;
        let mut builder = PackBuilder::new();
        for id in &available {
            builder.insert(repo.as_ref(), id)?;
        }
        let pack = builder.build();
        tracing::debug!(
            %peer,
            repo = %req.repo_id,
            objects = available.len(),
            bytes = pack.len(),
            "streaming packfile"
        );
        write_frames(stream, &pack).await?;
        Ok(())
    }
}

#[async_trait]
impl ProtocolHandler for PackfileServer {
    fn protocol(&self) -> Protocol {
        Protocol::Packfile
    }

    async fn handle(&self, peer: PeerId, _protocol: Protocol, mut stream: BoxStream) -> anyhow::Result<()> {
        let mut cycles = 0usize;
        while let Some(req) = try_read_message::<_, PackfileRequest>(&mut stream).await? {
            self.serve_one(peer, &mut stream, req).await?;
            cycles += 1;
        }
        tracing::trace!(%peer, cycles, "packfile stream closed");
        Ok(())
    }
}

// ── Client ───────────────────────────────────────────────────────────────────

/// Fetches scheduler batches of versioned objects as packfiles.
pub struct PackfileLane {
    keypair: Arc<Keypair>,
}

impl PackfileLane {
    pub fn new(keypair: Arc<Keypair>) -> Self {
        Self { keypair }
    }
}

#[async_trait]
impl Lane for PackfileLane {
    fn name(&self) -> &'static str {
        "packfile"
    }

    fn protocol(&self) -> Protocol {
        Protocol::Packfile
    }

    async fn transfer(&self, conn: &PeerConnection, jobs: Vec<Job>, out: &mpsc::Sender<Packet>) -> Outcome {
        let mut stream = match conn.open(Protocol::Packfile).await {
            Ok(s) => s,
            Err(e) => return Outcome::failed(jobs, e.into()),
        };
        fetch_packfile(&mut stream, &self.keypair, conn.repo_id(), jobs, out).await
    }
}

/// Run one packfile cycle on `stream`.
///
/// A failure after the header arrives costs the whole available subset:
/// nothing is credited for frames already forwarded, and the pack is marked
/// aborted so the consumer can drop them.
pub(crate) async fn fetch_packfile<S>(
    stream: &mut S,
    keypair: &Keypair,
    repo_id: &str,
    jobs: Vec<Job>,
    out: &mpsc::Sender<Packet>,
) -> Outcome
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let req = PackfileRequest {
        repo_id: repo_id.to_string(),
        signature: keypair.sign_hash(repo_id.as_bytes()),
        object_ids: jobs.iter().map(|j| j.object_id).collect(),
    };
    if let Err(e) = write_message(stream, &req).await {
        return Outcome::failed(jobs, e.into());
    }
    let resp: PackfileResponse = match read_message(stream).await {
        Ok(r) => r,
        Err(e) => return Outcome::failed(jobs, e.into()),
    };
    if !resp.authorized {
        return Outcome::failed(jobs, FetchError::Unauthorized(repo_id.to_string()));
    }

    let offered: HashSet<ObjectId> = resp.available.iter().copied().collect();
    let (available, missing): (Vec<Job>, Vec<Job>) =
        jobs.into_iter().partition(|j| offered.contains(&j.object_id));
    if available.len() != offered.len() {
        let mut all = available;
        all.extend(missing);
        return Outcome::failed(
            all,
            FetchError::Protocol("peer offered objects that were not requested".into()),
        );
    }
    if available.is_empty() {
        return Outcome {
            missing,
            ..Outcome::default()
        };
    }

    let ids: Vec<ObjectId> = available.iter().map(|j| j.object_id).collect();
    let packfile_id = pack_id(&ids);
    let uncompressed_size = available.iter().map(|j| j.expected_size).sum();
    if out
        .send(Packet::PackfileHeader {
            packfile_id,
            uncompressed_size,
        })
        .await
        .is_err()
    {
        return cancelled(available, missing);
    }

    loop {
        let frame: DataFrame = match read_message(stream).await {
            Ok(f) => f,
            Err(e) => {
                let _ = out.send(Packet::PackfileAborted { packfile_id }).await;
                let mut unfinished = available;
                unfinished.extend(missing);
                return Outcome::failed(unfinished, e.into());
            }
        };
        let end = frame.end;
        let packet = Packet::PackfileData {
            packfile_id,
            data: frame.data,
            end,
        };
        if out.send(packet).await.is_err() {
            return cancelled(available, missing);
        }
        if end {
            break;
        }
    }

    tracing::trace!(packfile = %hex::encode(&packfile_id[..8]), objects = available.len(), "packfile received");
    Outcome {
        delivered: available.len(),
        missing,
        ..Outcome::default()
    }
}

fn cancelled(mut jobs: Vec<Job>, missing: Vec<Job>) -> Outcome {
    jobs.extend(missing);
    Outcome::failed(jobs, FetchError::Cancelled)
}
