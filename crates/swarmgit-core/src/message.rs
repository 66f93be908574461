//! Protocol records: request and response shapes for every stream purpose.
//!
//! Field order in each `encode` is the wire order. Adding, removing or
//! reordering a field is a protocol change and needs a new protocol tag.

use bytes::{Bytes, BytesMut};

use crate::object::{CheckoutType, ObjectId};
use crate::wire::{
    get_bool, get_bytes, get_id, get_ids, get_string, get_u64, get_u8, put_bool, put_bytes,
    put_id, put_ids, put_str, put_u64, put_u8, Decode, Encode, WireError,
};

// ── Stream hello ─────────────────────────────────────────────────────────────

/// First record on a freshly opened stream over a raw byte transport.
///
/// Identifies the opening peer and the protocol the rest of the stream speaks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHello {
    pub peer: [u8; 32],
    pub protocol: String,
}

impl Encode for StreamHello {
    fn encode(&self, buf: &mut BytesMut) {
        put_bytes(buf, &self.peer);
        put_str(buf, &self.protocol);
    }
}

impl Decode for StreamHello {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        let raw = get_bytes(buf, "peer")?;
        let peer: [u8; 32] = raw
            .as_ref()
            .try_into()
            .map_err(|_| WireError::Truncated("peer"))?;
        Ok(Self {
            peer,
            protocol: get_string(buf, "protocol")?,
        })
    }
}

// ── Manifest ─────────────────────────────────────────────────────────────────

/// Ask a peer for the manifest of `commit`.
///
/// The signature covers the commit id bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRequest {
    pub repo_id: String,
    pub commit: ObjectId,
    pub checkout_type: CheckoutType,
    pub signature: Bytes,
}

impl Encode for ManifestRequest {
    fn encode(&self, buf: &mut BytesMut) {
        put_str(buf, &self.repo_id);
        put_id(buf, &self.commit);
        put_u8(buf, self.checkout_type.into());
        put_bytes(buf, &self.signature);
    }
}

impl Decode for ManifestRequest {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            repo_id: get_string(buf, "repo_id")?,
            commit: get_id(buf, "commit")?,
            checkout_type: CheckoutType::try_from(get_u8(buf, "checkout_type")?)?,
            signature: get_bytes(buf, "signature")?,
        })
    }
}

/// Header answering a [`ManifestRequest`]. Entries follow only when both flags are set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestResponse {
    pub authorized: bool,
    pub has_commit: bool,
}

impl Encode for ManifestResponse {
    fn encode(&self, buf: &mut BytesMut) {
        put_bool(buf, self.authorized);
        put_bool(buf, self.has_commit);
    }
}

impl Decode for ManifestResponse {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            authorized: get_bool(buf, "authorized")?,
            has_commit: get_bool(buf, "has_commit")?,
        })
    }
}

/// One streamed manifest entry.
///
/// The stream ends with a terminal entry (`end = true`, empty id). A terminal
/// entry with a non-empty `error` means the server could not finish the walk
/// and the whole manifest must be discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub end: bool,
    pub error: String,
    pub id: Bytes,
    pub uncompressed_size: u64,
}

impl ManifestEntry {
    pub fn object(id: &ObjectId, uncompressed_size: u64) -> Self {
        Self {
            end: false,
            error: String::new(),
            id: Bytes::copy_from_slice(id.as_bytes()),
            uncompressed_size,
        }
    }

    pub fn terminal() -> Self {
        Self {
            end: true,
            error: String::new(),
            id: Bytes::new(),
            uncompressed_size: 0,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            ..Self::terminal()
        }
    }
}

impl Encode for ManifestEntry {
    fn encode(&self, buf: &mut BytesMut) {
        put_bool(buf, self.end);
        put_str(buf, &self.error);
        put_bytes(buf, &self.id);
        put_u64(buf, self.uncompressed_size);
    }
}

impl Decode for ManifestEntry {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            end: get_bool(buf, "end")?,
            error: get_string(buf, "error")?,
            id: get_bytes(buf, "id")?,
            uncompressed_size: get_u64(buf, "uncompressed_size")?,
        })
    }
}

// ── Packfile ─────────────────────────────────────────────────────────────────

/// Ask a peer to pack the listed objects. The signature covers the repo id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackfileRequest {
    pub repo_id: String,
    pub signature: Bytes,
    pub object_ids: Vec<ObjectId>,
}

impl Encode for PackfileRequest {
    fn encode(&self, buf: &mut BytesMut) {
        put_str(buf, &self.repo_id);
        put_bytes(buf, &self.signature);
        put_ids(buf, &self.object_ids);
    }
}

impl Decode for PackfileRequest {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            repo_id: get_string(buf, "repo_id")?,
            signature: get_bytes(buf, "signature")?,
            object_ids: get_ids(buf, "object_ids")?,
        })
    }
}

/// Which of the requested objects the peer will pack.
///
/// When `available` is non-empty, data frames follow until an end frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackfileResponse {
    pub authorized: bool,
    pub available: Vec<ObjectId>,
}

impl Encode for PackfileResponse {
    fn encode(&self, buf: &mut BytesMut) {
        put_bool(buf, self.authorized);
        put_ids(buf, &self.available);
    }
}

impl Decode for PackfileResponse {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            authorized: get_bool(buf, "authorized")?,
            available: get_ids(buf, "available")?,
        })
    }
}

// ── Data frames ──────────────────────────────────────────────────────────────

/// A slice of a packfile or chunk payload. `end = true` is the sentinel and carries no data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub end: bool,
    pub data: Bytes,
}

impl DataFrame {
    pub fn data(data: Bytes) -> Self {
        Self { end: false, data }
    }

    pub fn end() -> Self {
        Self {
            end: true,
            data: Bytes::new(),
        }
    }
}

impl Encode for DataFrame {
    fn encode(&self, buf: &mut BytesMut) {
        put_bool(buf, self.end);
        put_bytes(buf, &self.data);
    }
}

impl Decode for DataFrame {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            end: get_bool(buf, "end")?,
            data: get_bytes(buf, "data")?,
        })
    }
}

// ── Single object (chunk/1.1, object/1.1) ────────────────────────────────────

/// Ask for one chunk (or, on the object protocol, one versioned object).
/// The signature covers the repo id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRequest {
    pub repo_id: String,
    pub signature: Bytes,
    pub object_id: ObjectId,
}

impl Encode for ChunkRequest {
    fn encode(&self, buf: &mut BytesMut) {
        put_str(buf, &self.repo_id);
        put_bytes(buf, &self.signature);
        put_id(buf, &self.object_id);
    }
}

impl Decode for ChunkRequest {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            repo_id: get_string(buf, "repo_id")?,
            signature: get_bytes(buf, "signature")?,
            object_id: get_id(buf, "object_id")?,
        })
    }
}

/// Header answering a [`ChunkRequest`]. Data frames follow only when both flags are set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkResponse {
    pub authorized: bool,
    pub found: bool,
    pub length: u64,
}

impl Encode for ChunkResponse {
    fn encode(&self, buf: &mut BytesMut) {
        put_bool(buf, self.authorized);
        put_bool(buf, self.found);
        put_u64(buf, self.length);
    }
}

impl Decode for ChunkResponse {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            authorized: get_bool(buf, "authorized")?,
            found: get_bool(buf, "found")?,
            length: get_u64(buf, "length")?,
        })
    }
}

// ── Replication ──────────────────────────────────────────────────────────────

/// Ask a replicator to pull `repo_id` from the swarm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationRequest {
    pub repo_id: String,
}

impl Encode for ReplicationRequest {
    fn encode(&self, buf: &mut BytesMut) {
        put_str(buf, &self.repo_id);
    }
}

impl Decode for ReplicationRequest {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            repo_id: get_string(buf, "repo_id")?,
        })
    }
}

/// Progress of a pull. `done` or a non-empty `error` ends the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    pub current: u64,
    pub total: u64,
    pub done: bool,
    pub error: String,
}

impl Progress {
    pub fn tick(current: u64, total: u64) -> Self {
        Self {
            current,
            total,
            ..Self::default()
        }
    }

    pub fn done(total: u64) -> Self {
        Self {
            current: total,
            total,
            done: true,
            error: String::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }

    /// True when no further records follow this one.
    pub fn is_terminal(&self) -> bool {
        self.done || self.is_error()
    }

    /// Completion percentage, 0..=100. A zero total counts as complete only when done.
    pub fn percent(&self) -> u8 {
        if self.done {
            return 100;
        }
        if self.total == 0 {
            return 0;
        }
        ((self.current.min(self.total) as u128 * 100) / self.total as u128) as u8
    }
}

impl Encode for Progress {
    fn encode(&self, buf: &mut BytesMut) {
        put_u64(buf, self.current);
        put_u64(buf, self.total);
        put_bool(buf, self.done);
        put_str(buf, &self.error);
    }
}

impl Decode for Progress {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            current: get_u64(buf, "current")?,
            total: get_u64(buf, "total")?,
            done: get_bool(buf, "done")?,
            error: get_string(buf, "error")?,
        })
    }
}

// ── Become replicator ────────────────────────────────────────────────────────

/// Ask a node to start replicating `repo_id`. The signature covers the repo id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BecomeReplicatorRequest {
    pub repo_id: String,
    pub signature: Bytes,
}

impl Encode for BecomeReplicatorRequest {
    fn encode(&self, buf: &mut BytesMut) {
        put_str(buf, &self.repo_id);
        put_bytes(buf, &self.signature);
    }
}

impl Decode for BecomeReplicatorRequest {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            repo_id: get_string(buf, "repo_id")?,
            signature: get_bytes(buf, "signature")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BecomeReplicatorResponse {
    pub accepted: bool,
    pub error: String,
}

impl Encode for BecomeReplicatorResponse {
    fn encode(&self, buf: &mut BytesMut) {
        put_bool(buf, self.accepted);
        put_str(buf, &self.error);
    }
}

impl Decode for BecomeReplicatorResponse {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            accepted: get_bool(buf, "accepted")?,
            error: get_string(buf, "error")?,
        })
    }
}
