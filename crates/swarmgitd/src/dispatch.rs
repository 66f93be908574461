//! Routes incoming streams to the handler registered for their protocol.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use swarmgit_core::Protocol;
use swarmgit_services::{BoxStream, IncomingStream, PeerId};

/// Server side of one protocol.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// The protocol this handler is registered under by default.
    fn protocol(&self) -> Protocol;

    /// Serve one stream to completion.
    async fn handle(&self, peer: PeerId, protocol: Protocol, stream: BoxStream)
        -> anyhow::Result<()>;
}

/// Maps protocols to handlers and runs each incoming stream on its own task.
#[derive(Default)]
pub struct ProtocolDispatcher {
    /// protocol -> handler. One handler may serve several protocols.
    handlers: HashMap<Protocol, Arc<dyn ProtocolHandler>>,
}

impl ProtocolDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own protocol.
    pub fn register(&mut self, handler: Arc<dyn ProtocolHandler>) {
        self.handlers.insert(handler.protocol(), handler);
    }

    /// Register an additional protocol -> handler mapping.
    /// Use when a handler serves more than one protocol.
    pub fn register_as(&mut self, protocol: Protocol, handler: Arc<dyn ProtocolHandler>) {
        self.handlers.insert(protocol, handler);
    }

    pub fn handles(&self, protocol: Protocol) -> bool {
        self.handlers.contains_key(&protocol)
    }

    /// Spawn the handler for `incoming`.
    /// Returns false (and drops the stream) if nothing serves its protocol.
    pub fn dispatch(&self, incoming: IncomingStream) -> bool {
        let IncomingStream {
            peer,
            protocol,
            stream,
        } = incoming;

        let Some(handler) = self.handlers.get(&protocol).cloned() else {
            tracing::debug!(%peer, %protocol, "no handler for protocol, dropping stream");
            return false;
        };

        tokio::spawn(async move {
            if let Err(e) = handler.handle(peer, protocol, stream).await {
                tracing::warn!(%peer, %protocol, error = %e, "stream handler failed");
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarmgit_services::{MemoryNetwork, Transport};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    struct Echo(mpsc::Sender<(PeerId, Protocol)>);

    #[async_trait]
    impl ProtocolHandler for Echo {
        fn protocol(&self) -> Protocol {
            Protocol::Chunk
        }

        async fn handle(
            &self,
            peer: PeerId,
            protocol: Protocol,
            mut stream: BoxStream,
        ) -> anyhow::Result<()> {
            self.0.send((peer, protocol)).await?;
            let mut buf = [0u8; 2];
            stream.read_exact(&mut buf).await?;
            stream.write_all(&buf).await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn routes_by_protocol() {
        let net = MemoryNetwork::new();
        let (client, _) = net.register(PeerId([1; 32]));
        let (_server, mut incoming) = net.register(PeerId([2; 32]));

        let (seen_tx, mut seen) = mpsc::channel(4);
        let echo = Arc::new(Echo(seen_tx));
        let mut d = ProtocolDispatcher::new();
        d.register(echo.clone());
        d.register_as(Protocol::Object, echo);
        assert!(d.handles(Protocol::Object));
        assert!(!d.handles(Protocol::Manifest));

        let mut out = client.open_stream(PeerId([2; 32]), Protocol::Object).await.unwrap();
        assert!(d.dispatch(incoming.recv().await.unwrap()));
        assert_eq!(seen.recv().await.unwrap(), (PeerId([1; 32]), Protocol::Object));

        out.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        out.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn unknown_protocol_is_dropped() {
        let net = MemoryNetwork::new();
        let (client, _) = net.register(PeerId([1; 32]));
        let (_server, mut incoming) = net.register(PeerId([2; 32]));

        let d = ProtocolDispatcher::new();
        let mut out = client.open_stream(PeerId([2; 32]), Protocol::Manifest).await.unwrap();
        assert!(!d.dispatch(incoming.recv().await.unwrap()));

        let mut buf = [0u8; 1];
        // the far end is gone, so the read sees EOF
        assert_eq!(out.read(&mut buf).await.unwrap(), 0);
    }
}
