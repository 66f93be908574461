//! Swarmgit integration test harness.
//!
//! Every test builds its own swarm of in-process nodes: one memory network,
//! one shared discovery table and ref registry, and a node per role with
//! its own identity, access list and repositories on disk.
//!
//!   cargo test --test integration

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use swarmgit_core::{Address, Keypair, ObjectId};
use swarmgit_services::{
    AccessRegistry, Commit, GitObject, LocalRepo, MemoryNetwork, MemoryRefs,
    PeerId, Repository, Shutdown, StaticDiscovery, Tree, TreeEntry,
};
use swarmgitd::{FetchSettings, Node, NodeParts, Puller, ReplicationPolicy};

mod failures;
mod fetch;
mod replication;

// ── Harness ───────────────────────────────────────────────────────────────────

static COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn temp_dir(tag: &str) -> PathBuf {
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "swarmgit-it-{}-{}-{}",
        tag,
        std::process::id(),
        id
    ));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

pub const REPO: &str = "alice/project";

/// Short timeouts so failure paths resolve quickly.
pub fn test_settings() -> FetchSettings {
    FetchSettings {
        max_concurrent_peers: 2,
        find_provider_timeout: Duration::from_millis(300),
        batch_timeout: Duration::from_millis(30),
    }
}

pub struct Swarm {
    pub net: MemoryNetwork,
    pub discovery: StaticDiscovery,
    pub refs: MemoryRefs,
}

pub struct TestNode {
    pub node: Arc<Node>,
    pub peer: PeerId,
    pub address: Address,
    pub access: Arc<AccessRegistry>,
    root: PathBuf,
}

impl Swarm {
    pub fn new() -> Self {
        Self {
            net: MemoryNetwork::new(),
            discovery: StaticDiscovery::new(),
            refs: MemoryRefs::new(),
        }
    }

    pub fn node(&self, tag: &str) -> TestNode {
        self.node_with(tag, ReplicationPolicy::default(), None)
    }

    /// Start a node serving every protocol.
    pub fn node_with(
        &self,
        tag: &str,
        policy: ReplicationPolicy,
        puller: Option<Arc<dyn Puller>>,
    ) -> TestNode {
        let keypair = Arc::new(Keypair::generate());
        let peer = PeerId(keypair.public());
        let address = keypair.address();
        let root = temp_dir(tag);
        let access = Arc::new(AccessRegistry::new());
        let (transport, incoming) = self.net.register(peer);

        let mut node = Node::new(NodeParts {
            keypair,
            transport: Arc::new(transport),
            discovery: Arc::new(self.discovery.clone()),
            repos: Arc::new(swarmgit_services::RepoSet::new(&root)),
            access: access.clone(),
            refs: Arc::new(self.refs.clone()),
            policy: Arc::new(policy),
            settings: test_settings(),
            shutdown: Shutdown::new(),
        });
        if let Some(puller) = puller {
            node.set_puller(puller);
        }
        let node = Arc::new(node);
        node.announce_local_repos();
        {
            let node = node.clone();
            tokio::spawn(async move { node.serve(incoming).await });
        }

        TestNode {
            node,
            peer,
            address,
            access,
            root,
        }
    }
}

impl TestNode {
    /// Create `repo_id` on this node and announce it.
    pub fn seed_repo(&self, repo_id: &str) -> Arc<LocalRepo> {
        let repo = Arc::new(LocalRepo::open(self.root.join(repo_id)).unwrap());
        self.node
            .repos()
            .insert(repo_id, repo.clone() as Arc<dyn Repository>);
        self.node.announce_local_repos();
        repo
    }

    /// Let `other` pull `repo_id` from this node.
    pub fn grant(&self, repo_id: &str, other: &TestNode) {
        self.access.grant(repo_id, other.address);
    }

    pub fn local_repo(&self, repo_id: &str) -> Arc<dyn Repository> {
        self.node.repos().get_or_open(repo_id).unwrap()
    }
}

// ── Fixture history ───────────────────────────────────────────────────────────

pub const BIG: &[u8] = b"aaaaabbbbbccccc";
pub const CHUNK_SIZE: usize = 5;

/// Commits `a -> b -> c`: `a` is empty, `b` adds a plain file, `c` adds a
/// file stored as three chunks.
pub struct History {
    pub commits: [ObjectId; 3],
    pub trees: [ObjectId; 3],
    pub blobs: [ObjectId; 2],
    pub chunks: Vec<ObjectId>,
}

impl History {
    pub fn head(&self) -> ObjectId {
        self.commits[2]
    }

    pub fn git_objects(&self) -> Vec<ObjectId> {
        let mut all = self.commits.to_vec();
        all.extend(self.trees);
        all.extend(self.blobs);
        all
    }
}

pub fn write_history(repo: &LocalRepo) -> History {
    let notes = repo
        .write_object(&GitObject::Blob(bytes::Bytes::from_static(b"meeting notes\n")))
        .unwrap();
    let big = repo.write_chunked_blob(BIG, CHUNK_SIZE).unwrap();
    let chunks: Vec<ObjectId> = BIG.chunks(CHUNK_SIZE).map(ObjectId::for_chunk).collect();

    let tree_a = repo.write_object(&GitObject::Tree(Tree { entries: vec![] })).unwrap();
    let tree_b = repo
        .write_object(&GitObject::Tree(Tree {
            entries: vec![TreeEntry::blob("notes.txt", notes)],
        }))
        .unwrap();
    let tree_c = repo
        .write_object(&GitObject::Tree(Tree {
            entries: vec![
                TreeEntry::blob("notes.txt", notes),
                TreeEntry::blob("big.bin", big),
            ],
        }))
        .unwrap();

    let a = commit(repo, tree_a, vec![], "a");
    let b = commit(repo, tree_b, vec![a], "b");
    let c = commit(repo, tree_c, vec![b], "c");
    History {
        commits: [a, b, c],
        trees: [tree_a, tree_b, tree_c],
        blobs: [notes, big],
        chunks,
    }
}

pub fn commit(repo: &LocalRepo, tree: ObjectId, parents: Vec<ObjectId>, message: &str) -> ObjectId {
    repo.write_object(&GitObject::Commit(Commit {
        tree,
        parents,
        message: message.into(),
    }))
    .unwrap()
}

/// Copy `ids` from one repository into another.
pub fn copy_objects(from: &dyn Repository, to: &dyn Repository, ids: &[ObjectId]) {
    for id in ids {
        to.write_raw(id, &from.read_raw(id).unwrap()).unwrap();
    }
}

/// Run `fut` with a generous upper bound so a hang fails the test.
pub async fn bounded<F: std::future::Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("test timed out")
}
