//! swarmgit-services: storage, access control, discovery, transport and the
//! scheduling machinery the protocols run on.

pub mod access;
pub mod discovery;
pub mod git;
pub mod manifest;
pub mod pack;
pub mod peer_pool;
pub mod refs;
pub mod repo;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod transport;

pub use access::{AccessControl, AccessRegistry};
pub use discovery::{ContentKey, Discovery, StaticDiscovery};
pub use git::{Commit, EntryKind, GitObject, Tree, TreeEntry};
pub use manifest::{build_manifest, ManifestError, ManifestWalk};
pub use pack::{pack_id, read_pack, PackBuilder, PackError};
pub use peer_pool::{PeerConnection, PeerPool, PoolStatus};
pub use refs::{MemoryRefs, RefRegistry};
pub use repo::{LocalRepo, RepoError, RepoSet, Repository};
pub use scheduler::{Batch, Job, JobScheduler};
pub use shutdown::Shutdown;
pub use store::{ContentStore, Layout};
pub use transport::{
    BoxStream, IncomingStream, MemoryNetwork, MemoryTransport, PeerId, Transport, TransportError,
};
