use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use swarmgit_core::message::Progress;
use swarmgit_services::{ContentKey, Discovery, Repository};
use swarmgitd::{Puller, ReplicationPolicy};

use crate::*;

async fn drain(mut rx: mpsc::Receiver<Progress>) -> Vec<Progress> {
    let mut all = Vec::new();
    while let Some(p) = rx.recv().await {
        all.push(p);
    }
    all
}

fn replicating(repo: &str) -> ReplicationPolicy {
    let policy = ReplicationPolicy::new(0, false);
    policy.allow(repo);
    policy
}

// ══════════════════════════════════════════════════════════════════════════════
//  Progress combination
// ══════════════════════════════════════════════════════════════════════════════

/// Reports fixed percentages at fixed times, then succeeds.
struct Paced(Vec<(u64, u64)>);

#[async_trait]
impl Puller for Paced {
    async fn pull(&self, _repo_id: &str, progress: mpsc::Sender<Progress>) -> anyhow::Result<()> {
        for &(after_ms, pct) in &self.0 {
            tokio::time::sleep(Duration::from_millis(after_ms)).await;
            let _ = progress.send(Progress::tick(pct, 100)).await;
        }
        Ok(())
    }
}

#[tokio::test]
async fn fastest_replicator_ends_the_stream() {
    let swarm = Swarm::new();
    // slow: 30% quickly, then stalls
    swarm.node_with(
        "slow",
        replicating(REPO),
        Some(Arc::new(Paced(vec![(0, 30), (5_000, 90)]))),
    );
    // fast: 70%, then done
    swarm.node_with(
        "fast",
        replicating(REPO),
        Some(Arc::new(Paced(vec![(40, 70), (40, 100)]))),
    );
    let client = swarm.node("client");

    let all = bounded(drain(client.node.replicate(REPO))).await;
    let pcts: Vec<u8> = all.iter().map(Progress::percent).collect();
    assert!(pcts.windows(2).all(|w| w[0] <= w[1]), "not monotonic: {pcts:?}");
    assert!(pcts.contains(&70));

    let last = all.last().unwrap();
    assert!(last.done && !last.is_error());
    assert_eq!(all.iter().filter(|p| p.is_terminal()).count(), 1);
}

// ══════════════════════════════════════════════════════════════════════════════
//  Pulling through the swarm
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn replicator_pulls_registered_head() {
    let swarm = Swarm::new();
    let origin = swarm.node("origin");
    let history = write_history(&origin.seed_repo(REPO));
    swarm.refs.set_head(REPO, history.head());

    let replicator = swarm.node_with("replicator", replicating(REPO), None);
    origin.grant(REPO, &replicator);
    let client = swarm.node("client");

    let all = bounded(drain(client.node.replicate(REPO))).await;
    let last = all.last().unwrap();
    assert!(last.done, "replication failed: {}", last.error);

    let copy = replicator.local_repo(REPO);
    for id in history.git_objects().iter().chain(&history.chunks) {
        assert!(copy.has_object(id), "{id} not replicated");
    }
}

#[tokio::test]
async fn become_replicator_then_replicate() {
    let swarm = Swarm::new();
    let origin = swarm.node("origin");
    let history = write_history(&origin.seed_repo(REPO));
    swarm.refs.set_head(REPO, history.head());

    let volunteer = swarm.node_with("volunteer", ReplicationPolicy::new(0, true), None);
    origin.grant(REPO, &volunteer);
    let client = swarm.node("client");
    volunteer.grant(REPO, &client);

    bounded(client.node.become_replicator(volunteer.peer, REPO))
        .await
        .unwrap();
    assert!(volunteer.node.policy().allows(REPO));

    let all = bounded(drain(client.node.replicate(REPO))).await;
    assert!(all.last().unwrap().done);
    assert!(volunteer.local_repo(REPO).has_object(&history.head()));
}

#[tokio::test]
async fn size_cap_refuses_large_repos() {
    let swarm = Swarm::new();
    let origin = swarm.node("origin");
    let history = write_history(&origin.seed_repo(REPO));
    swarm.refs.set_head(REPO, history.head());

    let policy = ReplicationPolicy::new(8, false);
    policy.allow(REPO);
    let replicator = swarm.node_with("tiny", policy, None);
    origin.grant(REPO, &replicator);
    let client = swarm.node("client");

    let all = bounded(drain(client.node.replicate(REPO))).await;
    assert_eq!(all.last().unwrap().error, "every replicator failed");
    assert!(!replicator.local_repo(REPO).has_object(&history.head()));
}

#[tokio::test]
async fn repo_off_the_allow_list_is_refused() {
    let swarm = Swarm::new();
    let replicator = swarm.node_with("other-repo", replicating("bob/elsewhere"), None);
    // announced for a repo it does not replicate
    swarm
        .discovery
        .announce(ContentKey::for_replicators(REPO), replicator.peer);
    let client = swarm.node("client");

    let all = bounded(drain(client.node.replicate(REPO))).await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].error, "every replicator failed");
}

#[tokio::test]
async fn unknown_head_fails_replication() {
    let swarm = Swarm::new();
    swarm.node_with("replicator", replicating(REPO), None);
    let client = swarm.node("client");

    let all = bounded(drain(client.node.replicate(REPO))).await;
    assert!(all.last().unwrap().is_error());
}
