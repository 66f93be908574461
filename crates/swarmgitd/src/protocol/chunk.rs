//! `chunk/1.1` and `object/1.1`: one object per exchange.
//!
//! The client sends a request signed over the repo id; the server answers
//! with `{authorized, found, length}` and, when both flags are set, the raw
//! bytes as data frames ending with a sentinel. A stream carries any number
//! of exchanges. `chunk/1.1` serves chunks, `object/1.1` serves versioned
//! objects; the exchange is identical.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use swarmgit_core::crypto::Hasher;
use swarmgit_core::message::{ChunkRequest, ChunkResponse};
use swarmgit_core::wire::{read_message, try_read_message, write_message, DATA_FRAME_SIZE};
use swarmgit_core::{Keypair, ObjectId, Protocol};
use swarmgit_services::repo::verify_content;
use swarmgit_services::{AccessControl, BoxStream, Job, PeerConnection, PeerId, RepoSet};

use super::{authorize, read_frames, write_frames};
use crate::dispatch::ProtocolHandler;
use crate::fetch::{FetchError, Lane, Outcome, Packet};

// ── Server ───────────────────────────────────────────────────────────────────

/// Serves single chunks, and single versioned objects when registered for
/// `object/1.1` as well.
pub struct ObjectServer {
    repos: Arc<RepoSet>,
    access: Arc<dyn AccessControl>,
}

impl ObjectServer {
    pub fn new(repos: Arc<RepoSet>, access: Arc<dyn AccessControl>) -> Self {
        Self { repos, access }
    }

    /// The object to serve, if it exists and matches the protocol's kind.
    fn lookup(&self, protocol: Protocol, repo_id: &str, id: &ObjectId) -> anyhow::Result<Option<Bytes>> {
        let wanted_chunk = protocol == Protocol::Chunk;
        if id.is_chunk() != wanted_chunk {
            return Ok(None);
        }
        let Some(repo) = self.repos.get(repo_id) else {
            return Ok(None);
        };
        if !repo.has_object(id) {
            return Ok(None);
        }
        Ok(Some(repo.read_raw(id)?))
    }

    async fn serve_one<S>(
        &self,
        peer: PeerId,
        protocol: Protocol,
        stream: &mut S,
        req: ChunkRequest,
    ) -> anyhow::Result<()>
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
        let data = if authorized {
            self.lookup(protocol, &req.repo_id, &req.object_id)?
        } else {
            None
        };

        let header = ChunkResponse {
            authorized,
            found: data.is_some(),
            length: data.as_ref().map_or(0, |d| d.len() as u64),
        };
        write_message(stream, &header).await?;
        match data {
            Some(data) => {
                tracing::trace!(%peer, %protocol, id = %req.object_id, bytes = data.len(), "serving object");
                write_frames(stream, &data).await?;
            }
            None => {
                tracing::debug!(%peer, %protocol, id = %req.object_id, authorized, "object not served");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolHandler for ObjectServer {
    fn protocol(&self) -> Protocol {
        Protocol::Chunk
    }

    async fn handle(&self, peer: PeerId, protocol: Protocol, mut stream: BoxStream) -> anyhow::Result<()> {
        while let Some(req) = try_read_message::<_, ChunkRequest>(&mut stream).await? {
            self.serve_one(peer, protocol, &mut stream, req).await?;
        }
        Ok(())
    }
}

// ── Client ───────────────────────────────────────────────────────────────────

/// Header and payload of one exchange.
enum Reply {
    Refused,
    NotFound,
    Found(Bytes),
}

async fn exchange<S>(
    stream: &mut S,
    keypair: &Keypair,
    repo_id: &str,
    id: ObjectId,
) -> Result<Reply, FetchError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let req = ChunkRequest {
        repo_id: repo_id.to_string(),
        signature: keypair.sign_hash(repo_id.as_bytes()),
        object_id: id,
    };
    write_message(stream, &req).await?;
    let header: ChunkResponse = read_message(stream).await?;
    if !header.authorized {
        return Ok(Reply::Refused);
    }
    if !header.found {
        return Ok(Reply::NotFound);
    }
    let data = read_frames(stream, header.length).await?;
    if data.len() as u64 != header.length {
        return Err(FetchError::Protocol(format!(
            "object {id} announced {} bytes, sent {}",
            header.length,
            data.len()
        )));
    }
    Ok(Reply::Found(data))
}

/// Fetch a single versioned object over `object/1.1`.
///
/// Returns None when the peer does not have it.
pub async fn request_object(
    conn: &PeerConnection,
    keypair: &Keypair,
    id: ObjectId,
) -> Result<Option<Bytes>, FetchError> {
    let mut stream = conn.open(Protocol::Object).await?;
    match exchange(&mut stream, keypair, conn.repo_id(), id).await? {
        Reply::Refused => Err(FetchError::Unauthorized(conn.repo_id().to_string())),
        Reply::NotFound => Ok(None),
        Reply::Found(data) => {
            verify_content(&id, &data)?;
            Ok(Some(data))
        }
    }
}

/// Fetches scheduler batches of chunks, one exchange per chunk on one stream.
pub struct ChunkLane {
    keypair: Arc<Keypair>,
}

impl ChunkLane {
    pub fn new(keypair: Arc<Keypair>) -> Self {
        Self { keypair }
    }
}

#[async_trait]
impl Lane for ChunkLane {
    fn name(&self) -> &'static str {
        "chunk"
    }

    fn protocol(&self) -> Protocol {
        Protocol::Chunk
    }

    async fn transfer(&self, conn: &PeerConnection, jobs: Vec<Job>, out: &mpsc::Sender<Packet>) -> Outcome {
        let mut stream = match conn.open(Protocol::Chunk).await {
            Ok(s) => s,
            Err(e) => return Outcome::failed(jobs, e.into()),
        };
        fetch_chunks(&mut stream, &self.keypair, conn.repo_id(), jobs, out).await
    }
}

/// Fetch each job's chunk in turn.
///
/// A chunk is forwarded only after its content hash checks out. The first
/// refusal or stream failure ends the batch; chunks already forwarded count.
pub(crate) async fn fetch_chunks<S>(
    stream: &mut S,
    keypair: &Keypair,
    repo_id: &str,
    jobs: Vec<Job>,
    out: &mpsc::Sender<Packet>,
) -> Outcome
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut outcome = Outcome::default();
    let mut queue = jobs.into_iter();
    while let Some(job) = queue.next() {
        let failure = match exchange(stream, keypair, repo_id, job.object_id).await {
            Ok(Reply::Found(data)) => match check_chunk(&job.object_id, &data) {
                Ok(()) => {
                    if forward(out, job.object_id, data).await.is_err() {
                        Some(FetchError::Cancelled)
                    } else {
                        outcome.delivered += 1;
                        continue;
                    }
                }
                Err(e) => Some(e),
            },
            Ok(Reply::NotFound) => {
                outcome.missing.push(job);
                continue;
            }
            Ok(Reply::Refused) => Some(FetchError::Unauthorized(repo_id.to_string())),
            Err(e) => Some(e),
        };
        outcome.unfinished.push(job);
        outcome.unfinished.extend(queue);
        outcome.failure = failure;
        break;
    }
    outcome
}

fn check_chunk(id: &ObjectId, data: &[u8]) -> Result<(), FetchError> {
    let mut hasher = Hasher::new();
    hasher.update(data);
    if ObjectId::Chunk(hasher.finalize()) != *id {
        return Err(FetchError::Protocol(format!("chunk {id} failed its content check")));
    }
    Ok(())
}

async fn forward(out: &mpsc::Sender<Packet>, object_id: ObjectId, data: Bytes) -> Result<(), ()> {
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + DATA_FRAME_SIZE).min(data.len());
        out.send(Packet::ChunkData {
            object_id,
            data: data.slice(offset..end),
            end: false,
        })
        .await
        .map_err(|_| ())?;
        offset = end;
    }
    out.send(Packet::ChunkData {
        object_id,
        data: Bytes::new(),
        end: true,
    })
    .await
    .map_err(|_| ())
}
