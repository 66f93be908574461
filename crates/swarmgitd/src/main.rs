//! swarmgitd: the Swarmgit peer daemon.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use swarmgit_core::config::SwarmgitConfig;
use swarmgit_core::{Keypair, ObjectId};
use swarmgit_services::{
    AccessRegistry, ContentKey, Discovery, MemoryRefs, PeerId, RepoSet, Shutdown, StaticDiscovery,
};

use swarmgitd::{tcp, FetchSettings, Node, NodeParts, ReplicationPolicy, TcpTransport};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = SwarmgitConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = SwarmgitConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        SwarmgitConfig::default()
    });

    // Keypair
    let keypair = Arc::new(
        Keypair::load_or_generate(&config.identity.keypair_path)
            .context("failed to load signing key")?,
    );
    let local = PeerId(keypair.public());
    tracing::info!(
        peer = %local,
        address = %keypair.address(),
        public_key = hex::encode(keypair.public()),
        "keypair ready"
    );

    // Repositories
    let repos = Arc::new(RepoSet::new(&config.storage.repos_root));
    repos
        .load_existing()
        .context("failed to scan repositories")?;
    tracing::info!(root = %config.storage.repos_root.display(), repos = repos.ids().len(), "repositories ready");

    let access = Arc::new(AccessRegistry::from_config(&config.access));
    let policy = Arc::new(ReplicationPolicy::from_config(&config.replication));

    let refs = MemoryRefs::new();
    for (repo, head) in &config.heads {
        match ObjectId::from_hex(head) {
            Ok(commit) => refs.set_head(repo.clone(), commit),
            Err(e) => tracing::warn!(repo = %repo, error = %e, "ignoring bad head"),
        }
    }

    // Static peers seed discovery and the address book
    let transport = TcpTransport::new(local);
    let discovery = StaticDiscovery::new();
    for peer in &config.peers {
        let (Some(id), Ok(addr)) = (PeerId::from_hex(&peer.id), peer.addr.parse::<SocketAddr>()) else {
            tracing::warn!(id = %peer.id, addr = %peer.addr, "ignoring malformed peer entry");
            continue;
        };
        transport.add_peer(id, addr);
        for repo in &peer.repos {
            discovery.announce(ContentKey::for_repo(repo), id);
        }
        for repo in &peer.replicates {
            discovery.announce(ContentKey::for_replicators(repo), id);
        }
    }
    tracing::info!(peers = config.peers.len(), "address book ready");

    // ── Shutdown ─────────────────────────────────────────────────────────────
    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            shutdown.trigger();
        });
    }

    let node = Node::new(NodeParts {
        keypair,
        transport: Arc::new(transport),
        discovery: Arc::new(discovery) as Arc<dyn Discovery>,
        repos,
        access,
        refs: Arc::new(refs),
        policy,
        settings: FetchSettings::from(&config.fetch),
        shutdown: shutdown.clone(),
    });
    node.announce_local_repos();

    let listener = TcpListener::bind(&config.network.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.network.listen_addr))?;
    tracing::info!(addr = %listener.local_addr()?, "swarmgitd listening");

    let incoming = tcp::listen(listener, &shutdown);
    node.serve(incoming).await;

    tracing::info!("swarmgitd stopped");
    Ok(())
}
