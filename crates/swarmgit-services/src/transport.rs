//! Stream substrate.
//!
//! The protocols need one thing from the network: a reliable, ordered byte
//! stream to a given peer, tagged with the protocol it will speak. The
//! [`Transport`] trait is that seam. The daemon plugs in TCP; tests plug in
//! [`MemoryNetwork`], which wires in-process nodes together with duplex pipes.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use swarmgit_core::{Protocol, WireError};

/// Buffer size of each direction of an in-process stream.
const MEMORY_PIPE_SIZE: usize = 64 * 1024;

/// A node's identity on the network: its ed25519 verifying key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Some(PeerId(bytes.try_into().ok()?))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex()[..16])
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

/// Anything a protocol can read from and write to.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

pub type BoxStream = Box<dyn Stream>;

/// A stream opened towards us by a remote peer.
pub struct IncomingStream {
    pub peer: PeerId,
    pub protocol: Protocol,
    pub stream: BoxStream,
}

impl fmt::Debug for IncomingStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingStream")
            .field("peer", &self.peer)
            .field("protocol", &self.protocol)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} unreachable")]
    Unreachable(PeerId),

    #[error("stream handshake failed: {0}")]
    Handshake(#[from] WireError),

    #[error("transport i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn local_peer(&self) -> PeerId;

    /// Open a fresh stream to `peer` speaking `protocol`.
    async fn open_stream(&self, peer: PeerId, protocol: Protocol)
        -> Result<BoxStream, TransportError>;
}

// ── In-process network ───────────────────────────────────────────────────────

/// Switchboard connecting in-process nodes.
///
/// Clones share the same switchboard.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    nodes: Arc<DashMap<PeerId, mpsc::Sender<IncomingStream>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node. Streams opened towards `peer` arrive on the returned receiver.
    pub fn register(&self, peer: PeerId) -> (MemoryTransport, mpsc::Receiver<IncomingStream>) {
        let (tx, rx) = mpsc::channel(64);
        self.nodes.insert(peer, tx);
        (
            MemoryTransport {
                local: peer,
                network: self.clone(),
            },
            rx,
        )
    }

    /// Detach a node. New streams towards it fail as unreachable.
    pub fn disconnect(&self, peer: &PeerId) {
        self.nodes.remove(peer);
        tracing::debug!(peer = %peer, "memory node disconnected");
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.nodes.contains_key(peer)
    }
}

#[derive(Clone)]
pub struct MemoryTransport {
    local: PeerId,
    network: MemoryNetwork,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: Protocol,
    ) -> Result<BoxStream, TransportError> {
        // Clone the sender out so no map guard is held across the await.
        let inbox = self
            .network
            .nodes
            .get(&peer)
            .map(|tx| tx.value().clone())
            .ok_or(TransportError::Unreachable(peer))?;

        let (ours, theirs) = tokio::io::duplex(MEMORY_PIPE_SIZE);
        inbox
            .send(IncomingStream {
                peer: self.local,
                protocol,
                stream: Box::new(theirs),
            })
            .await
            .map_err(|_| TransportError::Unreachable(peer))?;
        tracing::trace!(from = %self.local, to = %peer, %protocol, "memory stream opened");
        Ok(Box::new(ours))
    }
}
