//! swarmgitd: swarm protocols for pulling git objects and chunks from peers.
//!
//! Servers and clients for every stream protocol, the multi-peer fetch
//! driver, replication, and the node that ties them to a transport.

pub mod dispatch;
pub mod fetch;
pub mod ingest;
pub mod node;
pub mod protocol;
pub mod pull;
pub mod tcp;

pub use dispatch::{ProtocolDispatcher, ProtocolHandler};
pub use fetch::{FetchError, FetchSettings, FetchStream, Fetcher, Packet};
pub use ingest::{ingest, IngestReport};
pub use node::{Node, NodeParts};
pub use protocol::replication::{ReplicationPolicy, Replicator};
pub use pull::{Puller, SwarmPuller};
pub use tcp::TcpTransport;
