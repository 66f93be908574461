//! TCP stream transport.
//!
//! Every stream is its own TCP connection. The opener writes a
//! [`StreamHello`] naming itself and the protocol; the rest of the
//! connection belongs to that protocol. The peer id in the hello is only a
//! routing hint: requests are authorized by their signatures.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use swarmgit_core::message::StreamHello;
use swarmgit_core::wire::{read_message, write_message};
use swarmgit_core::Protocol;
use swarmgit_services::{BoxStream, IncomingStream, PeerId, Shutdown, Transport, TransportError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long an accepted connection may take to send its hello.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

const INCOMING_QUEUE: usize = 64;

/// Opens streams to peers listed in its address book.
#[derive(Clone)]
pub struct TcpTransport {
    local: PeerId,
    book: Arc<DashMap<PeerId, SocketAddr>>,
}

impl TcpTransport {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            book: Arc::new(DashMap::new()),
        }
    }

    pub fn add_peer(&self, peer: PeerId, addr: SocketAddr) {
        self.book.insert(peer, addr);
    }

    pub fn addr_of(&self, peer: &PeerId) -> Option<SocketAddr> {
        self.book.get(peer).map(|a| *a.value())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    async fn open_stream(&self, peer: PeerId, protocol: Protocol) -> Result<BoxStream, TransportError> {
        let addr = self.addr_of(&peer).ok_or(TransportError::Unreachable(peer))?;
        let mut stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                tracing::debug!(%peer, %addr, error = %e, "connect failed");
                return Err(TransportError::Unreachable(peer));
            }
            Err(_) => return Err(TransportError::Unreachable(peer)),
        };
        stream.set_nodelay(true)?;
        let hello = StreamHello {
            peer: self.local.0,
            protocol: protocol.as_str().to_string(),
        };
        write_message(&mut stream, &hello).await?;
        tracing::trace!(%peer, %addr, %protocol, "tcp stream opened");
        Ok(Box::new(stream))
    }
}

/// Accept connections on `listener` until shutdown, handing each one to the
/// returned channel once its hello has been read.
pub fn listen(listener: TcpListener, shutdown: &Shutdown) -> mpsc::Receiver<IncomingStream> {
    let (tx, rx) = mpsc::channel(INCOMING_QUEUE);
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            let (socket, remote) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(HELLO_TIMEOUT, greet(socket)).await {
                    Ok(Ok(incoming)) => {
                        let _ = tx.send(incoming).await;
                    }
                    Ok(Err(e)) => tracing::debug!(%remote, error = %e, "bad stream hello"),
                    Err(_) => tracing::debug!(%remote, "stream hello timed out"),
                }
            });
        }
        tracing::debug!("tcp listener stopped");
    });
    rx
}

async fn greet(mut socket: TcpStream) -> anyhow::Result<IncomingStream> {
    socket.set_nodelay(true)?;
    let hello: StreamHello = read_message(&mut socket).await?;
    let protocol = Protocol::try_from(hello.protocol.as_str())?;
    Ok(IncomingStream {
        peer: PeerId(hello.peer),
        protocol,
        stream: Box::new(socket),
    })
}
