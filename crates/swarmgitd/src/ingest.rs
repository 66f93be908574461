//! Ingest a fetch: reassemble packets into objects and store them.
//!
//! Packfile frames are keyed by packfile id and chunk frames by chunk id,
//! since transfers interleave. A completed packfile is unpacked and every
//! object in it written; a completed chunk is written as is. An aborted
//! packfile's partial bytes are dropped. The repository rejects bytes that
//! do not hash to their id.

use std::collections::HashMap;

use bytes::BytesMut;
use tokio::sync::mpsc;

use swarmgit_core::message::Progress;
use swarmgit_core::ObjectId;
use swarmgit_services::{read_pack, Repository};

use crate::fetch::{FetchError, FetchStream, Packet};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub packfiles: usize,
    pub objects: usize,
    pub chunks: usize,
    pub bytes: u64,
    /// Packfiles whose transfer died partway and were discarded.
    pub aborted: usize,
}

/// Drain `stream` into `repo`.
///
/// Succeeds only if every manifest object is in `repo` afterwards. Objects
/// written before a failure stay written.
pub async fn ingest(
    repo: &dyn Repository,
    stream: &mut FetchStream,
    progress: Option<&mpsc::Sender<Progress>>,
) -> Result<IngestReport, FetchError> {
    let total = stream.manifest().uncompressed_size();
    let mut packs: HashMap<[u8; 32], BytesMut> = HashMap::new();
    let mut chunks: HashMap<ObjectId, BytesMut> = HashMap::new();
    let mut report = IngestReport::default();

    while let Some(packet) = stream.recv().await {
        match packet {
            Packet::PackfileHeader {
                packfile_id,
                uncompressed_size,
            } => {
                // a retried transfer of the same subset starts over
                packs.insert(packfile_id, BytesMut::with_capacity(uncompressed_size as usize));
            }
            Packet::PackfileData {
                packfile_id,
                data,
                end,
            } => {
                let buf = packs.entry(packfile_id).or_default();
                buf.extend_from_slice(&data);
                if !end {
                    continue;
                }
                let pack = packs.remove(&packfile_id).unwrap_or_default();
                for (id, raw) in read_pack(&pack)? {
                    repo.write_raw(&id, &raw)?;
                    report.objects += 1;
                    report.bytes += raw.len() as u64;
                }
                report.packfiles += 1;
                tracing::debug!(packfile = %hex::encode(&packfile_id[..8]), objects = report.objects, "packfile stored");
            }
            Packet::PackfileAborted { packfile_id } => {
                if let Some(partial) = packs.remove(&packfile_id) {
                    report.aborted += 1;
                    tracing::debug!(
                        packfile = %hex::encode(&packfile_id[..8]),
                        bytes = partial.len(),
                        "dropping aborted packfile"
                    );
                }
                continue;
            }
            Packet::ChunkData { object_id, data, end } => {
                let buf = chunks.entry(object_id).or_default();
                buf.extend_from_slice(&data);
                if !end {
                    continue;
                }
                let chunk = chunks.remove(&object_id).unwrap_or_default();
                repo.write_raw(&object_id, &chunk)?;
                report.chunks += 1;
                report.bytes += chunk.len() as u64;
            }
            Packet::Error(e) => return Err(e),
        }
        if let Some(progress) = progress {
            // best effort; a gone listener does not stop the fetch
            let _ = progress.send(Progress::tick(report.bytes.min(total), total)).await;
        }
    }

    if stream.is_cancelled() {
        return Err(FetchError::Cancelled);
    }
    let manifest = stream.manifest();
    let absent = manifest
        .git_objects
        .iter()
        .chain(manifest.chunk_objects.iter())
        .filter(|o| !repo.has_object(&o.id))
        .count();
    if absent > 0 {
        return Err(FetchError::Unavailable(format!("{absent} objects never arrived")));
    }
    Ok(report)
}
