//! Swarmgit wire framing: how every protocol record crosses a stream.
//!
//! A message on the wire is an 8-byte little-endian length followed by that
//! many bytes of a packed record. Records pack their fields in declaration
//! order. Variable-length fields (byte strings, strings, lists) carry their
//! own little-endian `u64` length prefix. There is no reflection here: each
//! record implements [`Encode`] and [`Decode`] by hand, and the single pair
//! [`write_message`] / [`read_message`] frames all of them.
//!
//! Compression and encryption are the transport's business, not ours.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::object::ObjectId;

// ── Protocols ────────────────────────────────────────────────────────────────

/// Stream purposes, negotiated when a stream is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Manifest,
    Object,
    Packfile,
    Chunk,
    Replication,
    BecomeReplicator,
}

impl Protocol {
    pub const ALL: [Protocol; 6] = [
        Protocol::Manifest,
        Protocol::Object,
        Protocol::Packfile,
        Protocol::Chunk,
        Protocol::Replication,
        Protocol::BecomeReplicator,
    ];

    /// The protocol tag exchanged at stream-open time.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Manifest => "/swarmgit/manifest/1.0",
            Protocol::Object => "/swarmgit/object/1.1",
            Protocol::Packfile => "/swarmgit/packfile/1.0",
            Protocol::Chunk => "/swarmgit/chunk/1.1",
            Protocol::Replication => "/swarmgit/replication/1.1",
            Protocol::BecomeReplicator => "/swarmgit/become-replicator",
        }
    }
}

impl TryFrom<&str> for Protocol {
    type Error = WireError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Protocol::ALL
            .into_iter()
            .find(|p| p.as_str() == value)
            .ok_or_else(|| WireError::UnknownProtocol(value.to_string()))
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Constants ────────────────────────────────────────────────────────────────

/// Payload bytes carried by one data frame of a packfile or chunk transfer.
pub const DATA_FRAME_SIZE: usize = 32 * 1024;

/// Largest record we accept. Anything longer is treated as a malformed frame.
pub const MAX_MESSAGE_LEN: u64 = 64 * 1024 * 1024;

/// Width of the length prefix in front of every message.
pub const LENGTH_PREFIX_LEN: usize = 8;

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that can arise when framing or interpreting wire data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("stream ended unexpectedly")]
    UnexpectedEof,

    #[error("stream i/o failed: {0}")]
    Io(String),

    #[error("message length {0} exceeds maximum {}", MAX_MESSAGE_LEN)]
    MessageTooLarge(u64),

    #[error("record truncated while reading {0}")]
    Truncated(&'static str),

    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),

    #[error("invalid object id length {0}")]
    InvalidObjectId(usize),

    #[error("unknown checkout type: {0}")]
    UnknownCheckoutType(u8),

    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("field {0} is not valid utf-8")]
    InvalidUtf8(&'static str),

    #[error("invalid boolean byte 0x{0:02x}")]
    InvalidBool(u8),
}

impl WireError {
    /// True when the failure came from the byte stream rather than its content.
    ///
    /// Transport failures mean the peer went away; protocol failures mean it
    /// sent something we cannot interpret.
    pub fn is_transport(&self) -> bool {
        matches!(self, WireError::UnexpectedEof | WireError::Io(_))
    }
}

impl From<std::io::Error> for WireError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            WireError::UnexpectedEof
        } else {
            WireError::Io(e.to_string())
        }
    }
}

// ── Record capability ────────────────────────────────────────────────────────

/// A record that can pack itself into a message body.
pub trait Encode {
    fn encode(&self, buf: &mut BytesMut);
}

/// A record that can unpack itself from a message body.
pub trait Decode: Sized {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError>;
}

// ── Field helpers ────────────────────────────────────────────────────────────

pub fn put_u8(buf: &mut BytesMut, v: u8) {
    buf.put_u8(v);
}

pub fn put_u64(buf: &mut BytesMut, v: u64) {
    buf.put_u64_le(v);
}

pub fn put_bool(buf: &mut BytesMut, v: bool) {
    buf.put_u8(v as u8);
}

pub fn put_bytes(buf: &mut BytesMut, v: &[u8]) {
    buf.put_u64_le(v.len() as u64);
    buf.put_slice(v);
}

pub fn put_str(buf: &mut BytesMut, v: &str) {
    put_bytes(buf, v.as_bytes());
}

pub fn put_id(buf: &mut BytesMut, id: &ObjectId) {
    put_bytes(buf, id.as_bytes());
}

pub fn put_ids(buf: &mut BytesMut, ids: &[ObjectId]) {
    buf.put_u64_le(ids.len() as u64);
    for id in ids {
        put_id(buf, id);
    }
}

pub fn get_u8(buf: &mut Bytes, field: &'static str) -> Result<u8, WireError> {
    if buf.remaining() < 1 {
        return Err(WireError::Truncated(field));
    }
    Ok(buf.get_u8())
}

pub fn get_u64(buf: &mut Bytes, field: &'static str) -> Result<u64, WireError> {
    if buf.remaining() < 8 {
        return Err(WireError::Truncated(field));
    }
    Ok(buf.get_u64_le())
}

pub fn get_bool(buf: &mut Bytes, field: &'static str) -> Result<bool, WireError> {
    match get_u8(buf, field)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(WireError::InvalidBool(other)),
    }
}

pub fn get_bytes(buf: &mut Bytes, field: &'static str) -> Result<Bytes, WireError> {
    let len = get_u64(buf, field)?;
    if len > buf.remaining() as u64 {
        return Err(WireError::Truncated(field));
    }
    Ok(buf.split_to(len as usize))
}

pub fn get_string(buf: &mut Bytes, field: &'static str) -> Result<String, WireError> {
    let raw = get_bytes(buf, field)?;
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8(field))
}

pub fn get_id(buf: &mut Bytes, field: &'static str) -> Result<ObjectId, WireError> {
    let raw = get_bytes(buf, field)?;
    ObjectId::from_bytes(&raw)
}

pub fn get_ids(buf: &mut Bytes, field: &'static str) -> Result<Vec<ObjectId>, WireError> {
    let count = get_u64(buf, field)?;
    // Each id needs at least its own 8-byte length prefix.
    if count > (buf.remaining() / 8) as u64 {
        return Err(WireError::Truncated(field));
    }
    (0..count).map(|_| get_id(buf, field)).collect()
}

// ── Framing ──────────────────────────────────────────────────────────────────

/// Pack a record into a message body (without the length prefix).
pub fn encode_message<M: Encode>(msg: &M) -> Bytes {
    let mut buf = BytesMut::new();
    msg.encode(&mut buf);
    buf.freeze()
}

/// Unpack a message body, rejecting leftover bytes.
pub fn decode_message<M: Decode>(mut body: Bytes) -> Result<M, WireError> {
    let msg = M::decode(&mut body)?;
    if body.has_remaining() {
        return Err(WireError::TrailingBytes(body.remaining()));
    }
    Ok(msg)
}

/// Write one length-prefixed record and flush.
pub async fn write_message<W, M>(writer: &mut W, msg: &M) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
    M: Encode,
{
    let body = encode_message(msg);
    writer.write_all(&(body.len() as u64).to_le_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one record. A stream that ends before the record is complete is an error.
pub async fn read_message<R, M>(reader: &mut R) -> Result<M, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
    M: Decode,
{
    try_read_message(reader)
        .await?
        .ok_or(WireError::UnexpectedEof)
}

/// Read one record, or `None` if the stream ended cleanly on a message boundary.
///
/// Servers use this to tell "the peer is done issuing requests" apart from a
/// peer that vanished mid-record.
pub async fn try_read_message<R, M>(reader: &mut R) -> Result<Option<M>, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
    M: Decode,
{
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_LEN {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(WireError::UnexpectedEof);
        }
        filled += n;
    }

    let len = u64::from_le_bytes(prefix);
    if len > MAX_MESSAGE_LEN {
        return Err(WireError::MessageTooLarge(len));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    decode_message(Bytes::from(body)).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Sample {
        flag: bool,
        name: String,
        ids: Vec<ObjectId>,
        size: u64,
    }

    impl Encode for Sample {
        fn encode(&self, buf: &mut BytesMut) {
            put_bool(buf, self.flag);
            put_str(buf, &self.name);
            put_ids(buf, &self.ids);
            put_u64(buf, self.size);
        }
    }

    impl Decode for Sample {
        fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
            Ok(Sample {
                flag: get_bool(buf, "flag")?,
                name: get_string(buf, "name")?,
                ids: get_ids(buf, "ids")?,
                size: get_u64(buf, "size")?,
            })
        }
    }

    fn sample() -> Sample {
        Sample {
            flag: true,
            name: "repo".into(),
            ids: vec![ObjectId::Git([7; 20]), ObjectId::Chunk([9; 32])],
            size: 4096,
        }
    }

    #[tokio::test]
    async fn frame_has_little_endian_length_prefix() {
        let mut out: Vec<u8> = Vec::new();
        write_message(&mut out, &sample()).await.unwrap();

        let body_len = u64::from_le_bytes(out[..8].try_into().unwrap());
        assert_eq!(body_len as usize, out.len() - 8);
        // flag, then the string's own length prefix
        assert_eq!(out[8], 1);
        assert_eq!(u64::from_le_bytes(out[9..17].try_into().unwrap()), 4);
        assert_eq!(&out[17..21], b"repo");
    }

    #[tokio::test]
    async fn sequential_messages_share_one_stream() {
        let mut out: Vec<u8> = Vec::new();
        write_message(&mut out, &sample()).await.unwrap();
        let mut second = sample();
        second.flag = false;
        write_message(&mut out, &second).await.unwrap();

        let mut reader: &[u8] = &out;
        let a: Sample = read_message(&mut reader).await.unwrap();
        let b: Sample = read_message(&mut reader).await.unwrap();
        assert_eq!(a, sample());
        assert_eq!(b, second);

        let end: Option<Sample> = try_read_message(&mut reader).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn partial_prefix_is_unexpected_eof() {
        let mut reader: &[u8] = &[1, 0, 0];
        let err = read_message::<_, Sample>(&mut reader).await.unwrap_err();
        assert_eq!(err, WireError::UnexpectedEof);
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn truncated_body_is_unexpected_eof() {
        let mut out: Vec<u8> = Vec::new();
        write_message(&mut out, &sample()).await.unwrap();
        out.truncate(out.len() - 3);
        let mut reader: &[u8] = &out;
        let err = read_message::<_, Sample>(&mut reader).await.unwrap_err();
        assert_eq!(err, WireError::UnexpectedEof);
    }

    #[tokio::test]
    async fn oversized_length_is_protocol_error() {
        let prefix = (MAX_MESSAGE_LEN + 1).to_le_bytes();
        let mut reader: &[u8] = &prefix;
        let err = read_message::<_, Sample>(&mut reader).await.unwrap_err();
        assert!(matches!(err, WireError::MessageTooLarge(_)));
        assert!(!err.is_transport());
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut body = BytesMut::from(&encode_message(&sample())[..]);
        body.put_u8(0xff);
        let err = decode_message::<Sample>(body.freeze()).unwrap_err();
        assert_eq!(err, WireError::TrailingBytes(1));
    }

    #[test]
    fn lying_list_count_is_truncated() {
        let mut buf = BytesMut::new();
        put_bool(&mut buf, false);
        put_str(&mut buf, "");
        put_u64(&mut buf, u64::MAX);
        let err = decode_message::<Sample>(buf.freeze()).unwrap_err();
        assert_eq!(err, WireError::Truncated("ids"));
    }

    #[test]
    fn protocol_tags_round_trip() {
        for p in Protocol::ALL {
            assert_eq!(Protocol::try_from(p.as_str()).unwrap(), p);
        }
        assert!(Protocol::try_from("/swarmgit/bogus/0.1").is_err());
        assert!(Protocol::Manifest.as_str().ends_with("manifest/1.0"));
        assert!(Protocol::BecomeReplicator.as_str().ends_with("become-replicator"));
    }
}
