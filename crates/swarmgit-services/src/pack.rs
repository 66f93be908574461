//! Pack blobs: many versioned objects in one transferable byte string.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! "SGPK" | version u32 | count u32
//! count × ( id [20] | len u64 | raw [len] )
//! BLAKE3 of everything above [32]
//! ```
//!
//! Objects are ordered commits, then trees, then blobs, keeping insertion
//! order within each type. Callers insert most-recent objects first.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use swarmgit_core::object::GIT_ID_LEN;
use swarmgit_core::{ObjectId, ObjectKind};

use crate::git::ObjectType;
use crate::repo::{RepoError, Repository};

pub const PACK_MAGIC: &[u8; 4] = b"SGPK";
pub const PACK_VERSION: u32 = 1;
const TRAILER_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum PackError {
    #[error("not a pack (bad magic)")]
    BadMagic,

    #[error("unsupported pack version {0}")]
    UnsupportedVersion(u32),

    #[error("pack truncated")]
    Truncated,

    #[error("pack checksum mismatch")]
    ChecksumMismatch,

    #[error("pack entry {0} does not match its content")]
    ObjectMismatch(ObjectId),

    #[error("{0} trailing bytes after last pack entry")]
    TrailingBytes(usize),

    #[error("chunk {0} cannot be packed")]
    ChunkInPack(ObjectId),

    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// Identifier for a set of objects: BLAKE3 over the sorted ids.
///
/// The same set always gets the same id, whatever order it was requested in.
pub fn pack_id(ids: &[ObjectId]) -> [u8; 32] {
    let mut sorted = ids.to_vec();
    sorted.sort();
    let mut hasher = blake3::Hasher::new();
    for id in &sorted {
        hasher.update(id.as_bytes());
    }
    *hasher.finalize().as_bytes()
}

// ── Builder ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct PackBuilder {
    entries: Vec<(ObjectType, ObjectId, Bytes)>,
}

impl PackBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the object `id` read from `repo`.
    pub fn insert(&mut self, repo: &dyn Repository, id: &ObjectId) -> Result<(), PackError> {
        if id.kind() == ObjectKind::Chunk {
            return Err(PackError::ChunkInPack(*id));
        }
        let raw = repo.read_raw(id)?;
        let Some(&type_byte) = raw.first() else {
            return Err(RepoError::Decode(format!("object {id} is empty")).into());
        };
        let object_type = ObjectType::try_from(type_byte)?;
        self.entries.push((object_type, *id, raw));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize the pack.
    pub fn build(mut self) -> Bytes {
        // stable: keeps insertion order within a type
        self.entries.sort_by_key(|(object_type, _, _)| *object_type);

        let body_len: usize = self
            .entries
            .iter()
            .map(|(_, _, raw)| GIT_ID_LEN + 8 + raw.len())
            .sum();
        let mut buf = BytesMut::with_capacity(12 + body_len + TRAILER_LEN);
        buf.put_slice(PACK_MAGIC);
        buf.put_u32_le(PACK_VERSION);
        buf.put_u32_le(self.entries.len() as u32);
        for (_, id, raw) in &self.entries {
            buf.put_slice(id.as_bytes());
            buf.put_u64_le(raw.len() as u64);
            buf.put_slice(raw);
        }
        let checksum = blake3::hash(&buf);
        buf.put_slice(checksum.as_bytes());
        buf.freeze()
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// Parse and verify a pack, returning its objects in pack order.
pub fn read_pack(pack: &[u8]) -> Result<Vec<(ObjectId, Bytes)>, PackError> {
    if pack.len() < 12 + TRAILER_LEN {
        return Err(PackError::Truncated);
    }
    let (body, trailer) = pack.split_at(pack.len() - TRAILER_LEN);
    if blake3::hash(body).as_bytes() != trailer {
        return Err(PackError::ChecksumMismatch);
    }

    let mut buf = Bytes::copy_from_slice(body);
    if &buf.split_to(4)[..] != PACK_MAGIC {
        return Err(PackError::BadMagic);
    }
    let version = buf.get_u32_le();
    if version != PACK_VERSION {
        return Err(PackError::UnsupportedVersion(version));
    }
    let count = buf.get_u32_le();

    let mut objects = Vec::new();
    for _ in 0..count {
        if buf.remaining() < GIT_ID_LEN + 8 {
            return Err(PackError::Truncated);
        }
        let id = ObjectId::from_bytes(&buf.split_to(GIT_ID_LEN))
            .map_err(|_| PackError::Truncated)?;
        let len = buf.get_u64_le();
        if len > buf.remaining() as u64 {
            return Err(PackError::Truncated);
        }
        let raw = buf.split_to(len as usize);
        if ObjectId::for_git_object(&raw) != id {
            return Err(PackError::ObjectMismatch(id));
        }
        objects.push((id, raw));
    }
    if buf.has_remaining() {
        return Err(PackError::TrailingBytes(buf.remaining()));
    }
    Ok(objects)
}
