use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use swarmgit_core::{CheckoutType, ObjectId, Protocol};
use swarmgit_services::{ContentKey, Discovery, IncomingStream, PeerId, Repository, Shutdown};
use swarmgitd::FetchError;

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Authorization
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn no_grant_means_unauthorized() {
    let swarm = Swarm::new();
    let origin = swarm.node("origin");
    let client = swarm.node("client");
    let history = write_history(&origin.seed_repo(REPO));

    let err = bounded(client.node.fetch(REPO, history.head(), CheckoutType::Full))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Unauthorized(_)), "got {err:?}");
    assert!(!client.local_repo(REPO).has_object(&history.head()));
}

#[tokio::test]
async fn unauthorized_object_request_gets_no_payload() {
    let swarm = Swarm::new();
    let origin = swarm.node("origin");
    let client = swarm.node("client");
    let history = write_history(&origin.seed_repo(REPO));

    let err = bounded(client.node.request_object(origin.peer, REPO, history.blobs[0]))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Unauthorized(_)));
}

#[tokio::test]
async fn grant_for_another_repo_does_not_count() {
    let swarm = Swarm::new();
    let origin = swarm.node("origin");
    let client = swarm.node("client");
    let history = write_history(&origin.seed_repo(REPO));
    origin.grant("alice/other", &client);

    let err = bounded(client.node.fetch(REPO, history.head(), CheckoutType::Sparse))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Unauthorized(_)));
}

// ══════════════════════════════════════════════════════════════════════════════
//  Missing data
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn unknown_repo_has_no_providers() {
    let swarm = Swarm::new();
    let client = swarm.node("client");

    let err = bounded(client.node.fetch("nobody/nothing", ObjectId::Git([1; 20]), CheckoutType::Full))
        .await
        .unwrap_err();
    assert_eq!(err, FetchError::NoProviders("nobody/nothing".into()));
}

#[tokio::test]
async fn unknown_commit_is_missing() {
    let swarm = Swarm::new();
    let origin = swarm.node("origin");
    let client = swarm.node("client");
    write_history(&origin.seed_repo(REPO));
    origin.grant(REPO, &client);

    let ghost = ObjectId::Git([0x42; 20]);
    let err = bounded(client.node.fetch(REPO, ghost, CheckoutType::Full))
        .await
        .unwrap_err();
    assert_eq!(err, FetchError::MissingCommit(ghost));
}

#[tokio::test]
async fn chunk_nobody_has_fails_the_fetch() {
    let swarm = Swarm::new();
    let origin = swarm.node("origin");
    let client = swarm.node("client");
    let repo = origin.seed_repo(REPO);
    let history = write_history(&repo);
    origin.grant(REPO, &client);

    // a second node with everything except the last chunk
    let mirror = swarm.node("mirror");
    let all: Vec<ObjectId> = history
        .git_objects()
        .into_iter()
        .chain(history.chunks[..2].iter().copied())
        .collect();
    copy_objects(repo.as_ref(), mirror.seed_repo(REPO).as_ref(), &all);
    mirror.grant(REPO, &client);
    swarm.net.disconnect(&origin.peer);

    let err = bounded(client.node.fetch(REPO, history.head(), CheckoutType::Full))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Unavailable(_)), "got {err:?}");
}

// ══════════════════════════════════════════════════════════════════════════════
//  Peer failures
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn unreachable_provider_is_replaced() {
    let swarm = Swarm::new();
    let origin = swarm.node("origin");
    let mirror = swarm.node("mirror");
    let client = swarm.node("client");
    let history = write_history(&origin.seed_repo(REPO));
    let everything: Vec<ObjectId> = history
        .git_objects()
        .into_iter()
        .chain(history.chunks.iter().copied())
        .collect();
    copy_objects(
        origin.local_repo(REPO).as_ref(),
        mirror.seed_repo(REPO).as_ref(),
        &everything,
    );
    origin.grant(REPO, &client);
    mirror.grant(REPO, &client);

    // origin stays in discovery but can no longer be reached
    swarm.net.disconnect(&origin.peer);

    let report = bounded(client.node.fetch(REPO, history.head(), CheckoutType::Full))
        .await
        .unwrap();
    assert_eq!(report.objects + report.chunks, everything.len());
}

#[tokio::test]
async fn every_provider_unreachable_fails() {
    let swarm = Swarm::new();
    let origin = swarm.node("origin");
    let client = swarm.node("client");
    let history = write_history(&origin.seed_repo(REPO));
    origin.grant(REPO, &client);
    swarm.net.disconnect(&origin.peer);

    let err = bounded(client.node.fetch(REPO, history.head(), CheckoutType::Full))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Transport(_)), "got {err:?}");
}

#[tokio::test]
async fn cancelled_manifest_request() {
    let swarm = Swarm::new();
    let client = swarm.node("client");
    let shutdown = Shutdown::new();
    shutdown.trigger();

    let err = bounded(client.node.fetcher().fetch_manifest(
        "nobody/nothing",
        ObjectId::Git([1; 20]),
        CheckoutType::Full,
        &shutdown,
    ))
    .await
    .unwrap_err();
    assert_eq!(err, FetchError::Cancelled);
}

// ══════════════════════════════════════════════════════════════════════════════
//  Cancellation mid-fetch
// ══════════════════════════════════════════════════════════════════════════════

/// A provider that answers manifest requests from a hidden origin but holds
/// every transfer stream open without replying.
struct Stalling {
    history: History,
    /// One message per transfer stream accepted.
    opened: mpsc::UnboundedReceiver<Protocol>,
    /// One message per transfer stream the client let go of.
    closed: mpsc::UnboundedReceiver<Protocol>,
}

fn stalling_provider(swarm: &Swarm, client: &TestNode) -> Stalling {
    // origin sits on its own switchboard so the client can only find the staller
    let backstage = Swarm::new();
    let origin = backstage.node("origin");
    let history = write_history(&origin.seed_repo(REPO));
    origin.access.grant(REPO, client.address);
    let serve_manifests = origin.node.dispatcher();

    let peer = PeerId([0x5a; 32]);
    let (_transport, mut incoming) = swarm.net.register(peer);
    swarm.discovery.announce(ContentKey::for_repo(REPO), peer);

    let (opened_tx, opened) = mpsc::unbounded_channel();
    let (closed_tx, closed) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let _origin = origin;
        while let Some(s) = incoming.recv().await {
            if s.protocol == Protocol::Manifest {
                serve_manifests.dispatch(s);
                continue;
            }
            let IncomingStream { protocol, mut stream, .. } = s;
            let _ = opened_tx.send(protocol);
            let closed_tx = closed_tx.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
                let _ = closed_tx.send(protocol);
            });
        }
    });

    Stalling {
        history,
        opened,
        closed,
    }
}

async fn expect_streams(rx: &mut mpsc::UnboundedReceiver<Protocol>) {
    let mut seen = Vec::new();
    while !(seen.contains(&Protocol::Packfile) && seen.contains(&Protocol::Chunk)) {
        seen.push(rx.recv().await.unwrap());
    }
}

#[tokio::test]
async fn dropped_fetch_releases_every_stream() {
    let swarm = Swarm::new();
    let client = swarm.node("client");
    let mut staller = stalling_provider(&swarm, &client);

    let stream = bounded(client.node.fetcher().fetch_from_commit(
        REPO,
        staller.history.head(),
        CheckoutType::Full,
        None,
        &Shutdown::new(),
    ))
    .await
    .unwrap();
    // both lanes have a transfer parked on the staller
    bounded(expect_streams(&mut staller.opened)).await;

    drop(stream);
    bounded(expect_streams(&mut staller.closed)).await;
}

#[tokio::test]
async fn cancelled_fetch_ends_the_stream() {
    let swarm = Swarm::new();
    let client = swarm.node("client");
    let mut staller = stalling_provider(&swarm, &client);

    let shutdown = Shutdown::new();
    let mut stream = bounded(client.node.fetcher().fetch_from_commit(
        REPO,
        staller.history.head(),
        CheckoutType::Full,
        None,
        &shutdown,
    ))
    .await
    .unwrap();
    bounded(expect_streams(&mut staller.opened)).await;

    shutdown.trigger();
    // the stream ends only once both lanes have exited
    let mut errors = 0;
    while let Some(packet) = bounded(stream.recv()).await {
        if matches!(packet, swarmgitd::Packet::Error(_)) {
            errors += 1;
        }
    }
    assert_eq!(errors, 0);
    assert!(stream.is_cancelled());
    bounded(expect_streams(&mut staller.closed)).await;
}
