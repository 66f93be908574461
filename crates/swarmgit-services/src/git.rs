//! Versioned object model: commits, trees and blobs.
//!
//! The raw form of an object is one type byte followed by its body. The
//! object id is the first 20 bytes of the BLAKE3 hash of the raw form, so
//! the raw bytes are self-verifying.
//!
//! Large files are not stored as ordinary blobs. Their blob holds a pointer:
//! the [`CHUNKED_HEADER`] token followed by the concatenated 32-byte ids of
//! the chunks that make up the file, in order.

use bytes::{BufMut, Bytes, BytesMut};

use swarmgit_core::object::CHUNK_ID_LEN;
use swarmgit_core::wire::{
    get_id, get_ids, get_string, get_u64, get_u8, put_id, put_ids, put_str, put_u64, put_u8,
};
use swarmgit_core::ObjectId;

use crate::repo::RepoError;

/// First bytes of a blob that points at chunks instead of holding content.
pub const CHUNKED_HEADER: &[u8] = b"SWARMGIT_CHUNKED_V1\n";

/// Type byte at the start of a raw object. Also the pack ordering rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ObjectType {
    Commit = 1,
    Tree = 2,
    Blob = 3,
}

impl TryFrom<u8> for ObjectType {
    type Error = RepoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ObjectType::Commit),
            2 => Ok(ObjectType::Tree),
            3 => Ok(ObjectType::Blob),
            other => Err(RepoError::Decode(format!("unknown object type {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    Blob = 0,
    Tree = 1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: String,
    pub kind: EntryKind,
    pub id: ObjectId,
}

impl TreeEntry {
    pub fn blob(name: impl Into<String>, id: ObjectId) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Blob,
            id,
        }
    }

    pub fn tree(name: impl Into<String>, id: ObjectId) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Tree,
            id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    pub entries: Vec<TreeEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitObject {
    Commit(Commit),
    Tree(Tree),
    Blob(Bytes),
}

impl GitObject {
    pub fn object_type(&self) -> ObjectType {
        match self {
            GitObject::Commit(_) => ObjectType::Commit,
            GitObject::Tree(_) => ObjectType::Tree,
            GitObject::Blob(_) => ObjectType::Blob,
        }
    }

    /// Raw form: type byte, then body.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_u8(&mut buf, self.object_type() as u8);
        match self {
            GitObject::Commit(c) => {
                put_id(&mut buf, &c.tree);
                put_ids(&mut buf, &c.parents);
                put_str(&mut buf, &c.message);
            }
            GitObject::Tree(t) => {
                put_u64(&mut buf, t.entries.len() as u64);
                for entry in &t.entries {
                    put_str(&mut buf, &entry.name);
                    put_u8(&mut buf, entry.kind as u8);
                    put_id(&mut buf, &entry.id);
                }
            }
            GitObject::Blob(data) => buf.put_slice(data),
        }
        buf.freeze()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, RepoError> {
        let mut buf = Bytes::copy_from_slice(raw);
        let kind = ObjectType::try_from(get_u8(&mut buf, "type").map_err(decode_err)?)?;
        let object = match kind {
            ObjectType::Commit => GitObject::Commit(Commit {
                tree: get_id(&mut buf, "tree").map_err(decode_err)?,
                parents: get_ids(&mut buf, "parents").map_err(decode_err)?,
                message: get_string(&mut buf, "message").map_err(decode_err)?,
            }),
            ObjectType::Tree => {
                let count = get_u64(&mut buf, "entries").map_err(decode_err)?;
                let mut entries = Vec::new();
                for _ in 0..count {
                    let name = get_string(&mut buf, "name").map_err(decode_err)?;
                    let kind = match get_u8(&mut buf, "kind").map_err(decode_err)? {
                        0 => EntryKind::Blob,
                        1 => EntryKind::Tree,
                        other => {
                            return Err(RepoError::Decode(format!("unknown entry kind {other}")))
                        }
                    };
                    let id = get_id(&mut buf, "id").map_err(decode_err)?;
                    entries.push(TreeEntry { name, kind, id });
                }
                GitObject::Tree(Tree { entries })
            }
            ObjectType::Blob => return Ok(GitObject::Blob(buf)),
        };
        if !buf.is_empty() {
            return Err(RepoError::Decode(format!(
                "{} trailing bytes in {kind:?}",
                buf.len()
            )));
        }
        Ok(object)
    }

    /// Id of this object's raw form.
    pub fn id(&self) -> ObjectId {
        ObjectId::for_git_object(&self.encode())
    }
}

fn decode_err(e: swarmgit_core::WireError) -> RepoError {
    RepoError::Decode(e.to_string())
}

// ── Chunked blobs ────────────────────────────────────────────────────────────

/// Body of a blob that points at `chunks`.
pub fn chunked_blob(chunks: &[ObjectId]) -> Bytes {
    let mut buf = BytesMut::with_capacity(CHUNKED_HEADER.len() + chunks.len() * CHUNK_ID_LEN);
    buf.put_slice(CHUNKED_HEADER);
    for id in chunks {
        buf.put_slice(id.as_bytes());
    }
    buf.freeze()
}

/// Chunk ids referenced by a blob body, or None for an ordinary blob.
///
/// A body that starts with the header but is not a whole list of ids is an
/// ordinary file that happens to share the prefix.
pub fn parse_chunked(blob: &[u8]) -> Option<Vec<ObjectId>> {
    let ids = blob.strip_prefix(CHUNKED_HEADER)?;
    if ids.len() % CHUNK_ID_LEN != 0 {
        return None;
    }
    ids.chunks_exact(CHUNK_ID_LEN)
        .map(|raw| ObjectId::from_bytes(raw).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_commit() -> GitObject {
        GitObject::Commit(Commit {
            tree: ObjectId::Git([1; 20]),
            parents: vec![ObjectId::Git([2; 20]), ObjectId::Git([3; 20])],
            message: "merge".into(),
        })
    }

    #[test]
    fn commit_decodes_to_itself() {
        let commit = sample_commit();
        assert_eq!(GitObject::decode(&commit.encode()).unwrap(), commit);
        assert_eq!(commit.encode()[0], ObjectType::Commit as u8);
    }

    #[test]
    fn tree_decodes_to_itself() {
        let tree = GitObject::Tree(Tree {
            entries: vec![
                TreeEntry::blob("README", ObjectId::Git([4; 20])),
                TreeEntry::tree("src", ObjectId::Git([5; 20])),
            ],
        });
        assert_eq!(GitObject::decode(&tree.encode()).unwrap(), tree);
    }

    #[test]
    fn id_depends_on_type() {
        // Same body bytes, different type byte.
        let blob = GitObject::Blob(Bytes::from_static(b""));
        let tree = GitObject::Tree(Tree::default());
        assert_ne!(blob.id(), tree.id());
    }

    #[test]
    fn unknown_type_is_decode_error() {
        assert!(matches!(
            GitObject::decode(&[9, 0, 0]),
            Err(RepoError::Decode(_))
        ));
    }

    #[test]
    fn chunked_pointer_round_trip() {
        let chunks = vec![ObjectId::for_chunk(b"a"), ObjectId::for_chunk(b"b")];
        let body = chunked_blob(&chunks);
        assert!(body.starts_with(CHUNKED_HEADER));
        assert_eq!(parse_chunked(&body), Some(chunks));
        assert_eq!(parse_chunked(b"plain text"), None);
    }

    #[test]
    fn ragged_body_behind_the_header_is_a_plain_blob() {
        let mut body = chunked_blob(&[ObjectId::for_chunk(b"a")]).to_vec();
        body.push(0);
        assert_eq!(parse_chunked(&body), None);

        let mut prose = CHUNKED_HEADER.to_vec();
        prose.extend_from_slice(b"is the marker we use for chunked files\n");
        assert_eq!(parse_chunked(&prose), None);
    }
}
