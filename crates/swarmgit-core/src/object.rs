//! Object identifiers and manifest types.
//!
//! Two kinds of object travel through the swarm: versioned (git) objects,
//! identified by a 20-byte hash, and chunks of large files stored outside
//! the object database, identified by a 32-byte BLAKE3 hash. The length of
//! the identifier alone tells the two apart.

use std::fmt;

use crate::wire::WireError;

/// Width of a versioned object identifier.
pub const GIT_ID_LEN: usize = 20;

/// Width of a chunk identifier (full BLAKE3 digest).
pub const CHUNK_ID_LEN: usize = 32;

/// Opaque key for a versioned object or a chunk.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectId {
    Git([u8; GIT_ID_LEN]),
    Chunk([u8; CHUNK_ID_LEN]),
}

/// Which store an object lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Git,
    Chunk,
}

impl ObjectId {
    /// Interpret raw bytes as an identifier, discriminating by length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        match bytes.len() {
            GIT_ID_LEN => {
                let mut id = [0u8; GIT_ID_LEN];
                id.copy_from_slice(bytes);
                Ok(ObjectId::Git(id))
            }
            CHUNK_ID_LEN => {
                let mut id = [0u8; CHUNK_ID_LEN];
                id.copy_from_slice(bytes);
                Ok(ObjectId::Chunk(id))
            }
            other => Err(WireError::InvalidObjectId(other)),
        }
    }

    /// Parse a hex string (40 chars for versioned objects, 64 for chunks).
    pub fn from_hex(s: &str) -> Result<Self, WireError> {
        let bytes = hex::decode(s).map_err(|_| WireError::InvalidObjectId(s.len() / 2))?;
        Self::from_bytes(&bytes)
    }

    /// Identifier of a versioned object with the given raw (type-prefixed) encoding.
    pub fn for_git_object(raw: &[u8]) -> Self {
        let digest = blake3::hash(raw);
        let mut id = [0u8; GIT_ID_LEN];
        id.copy_from_slice(&digest.as_bytes()[..GIT_ID_LEN]);
        ObjectId::Git(id)
    }

    /// Identifier of a chunk with the given content.
    pub fn for_chunk(data: &[u8]) -> Self {
        ObjectId::Chunk(*blake3::hash(data).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ObjectId::Git(id) => id,
            ObjectId::Chunk(id) => id,
        }
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            ObjectId::Git(_) => ObjectKind::Git,
            ObjectId::Chunk(_) => ObjectKind::Chunk,
        }
    }

    pub fn is_chunk(&self) -> bool {
        matches!(self, ObjectId::Chunk(_))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        match self {
            ObjectId::Git(_) => write!(f, "Git({})", &hex[..12]),
            ObjectId::Chunk(_) => write!(f, "Chunk({})", &hex[..12]),
        }
    }
}

// ── Checkout policy ──────────────────────────────────────────────────────────

/// How much chunk data a manifest includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CheckoutType {
    /// No chunk data at all.
    Sparse = 0,
    /// Chunks only for blobs reachable from the requested commit's own tree.
    #[default]
    Working = 1,
    /// Chunks for every blob in the reachable history.
    Full = 2,
}

impl TryFrom<u8> for CheckoutType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CheckoutType::Sparse),
            1 => Ok(CheckoutType::Working),
            2 => Ok(CheckoutType::Full),
            other => Err(WireError::UnknownCheckoutType(other)),
        }
    }
}

impl From<CheckoutType> for u8 {
    fn from(c: CheckoutType) -> u8 {
        c as u8
    }
}

// ── Manifest ─────────────────────────────────────────────────────────────────

/// One entry of a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestObject {
    pub id: ObjectId,
    pub uncompressed_size: u64,
}

/// An ordered list of manifest entries of one kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestObjects(pub Vec<ManifestObject>);

impl ManifestObjects {
    /// Sum of the uncompressed sizes of every entry.
    pub fn uncompressed_size(&self) -> u64 {
        self.0.iter().map(|o| o.uncompressed_size).sum()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManifestObject> {
        self.0.iter()
    }
}

/// A complete manifest split by object kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestObjectSet {
    pub git_objects: ManifestObjects,
    pub chunk_objects: ManifestObjects,
}

impl ManifestObjectSet {
    /// Route an entry into the list matching its identifier kind.
    pub fn push(&mut self, object: ManifestObject) {
        match object.id.kind() {
            ObjectKind::Git => self.git_objects.0.push(object),
            ObjectKind::Chunk => self.chunk_objects.0.push(object),
        }
    }

    /// Drop every entry the predicate rejects, from both lists.
    pub fn retain(&mut self, mut keep: impl FnMut(&ManifestObject) -> bool) {
        self.git_objects.0.retain(&mut keep);
        self.chunk_objects.0.retain(&mut keep);
    }

    pub fn uncompressed_size(&self) -> u64 {
        self.git_objects.uncompressed_size() + self.chunk_objects.uncompressed_size()
    }

    pub fn is_empty(&self) -> bool {
        self.git_objects.is_empty() && self.chunk_objects.is_empty()
    }
}
