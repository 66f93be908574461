use std::collections::HashSet;

use swarmgit_core::{CheckoutType, ObjectId};
use swarmgit_services::{GitObject, Repository, Shutdown, Tree, TreeEntry};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Manifests
// ══════════════════════════════════════════════════════════════════════════════

fn ids(objects: &swarmgit_core::ManifestObjects) -> HashSet<ObjectId> {
    objects.iter().map(|o| o.id).collect()
}

#[tokio::test]
async fn full_manifest_covers_history_once() {
    let swarm = Swarm::new();
    let origin = swarm.node("origin");
    let client = swarm.node("client");
    let history = write_history(&origin.seed_repo(REPO));
    origin.grant(REPO, &client);

    let m = bounded(client.node.fetcher().fetch_manifest(
        REPO,
        history.head(),
        CheckoutType::Full,
        &Shutdown::new(),
    ))
    .await
    .unwrap();

    assert_eq!(m.git_objects.len(), 8, "3 commits, 3 trees, 2 blobs");
    assert_eq!(ids(&m.git_objects), history.git_objects().into_iter().collect());
    assert_eq!(m.chunk_objects.len(), 3);
    assert_eq!(ids(&m.chunk_objects), history.chunks.iter().copied().collect());
}

#[tokio::test]
async fn checkout_types_only_change_chunks() {
    let swarm = Swarm::new();
    let origin = swarm.node("origin");
    let client = swarm.node("client");
    let history = write_history(&origin.seed_repo(REPO));
    origin.grant(REPO, &client);

    let mut manifests = Vec::new();
    for checkout in [CheckoutType::Sparse, CheckoutType::Working, CheckoutType::Full] {
        manifests.push(
            bounded(client.node.fetcher().fetch_manifest(REPO, history.head(), checkout, &Shutdown::new()))
                .await
                .unwrap(),
        );
    }
    let [sparse, working, full] = <[_; 3]>::try_from(manifests).unwrap();

    assert_eq!(ids(&sparse.git_objects), ids(&full.git_objects));
    assert_eq!(ids(&working.git_objects), ids(&full.git_objects));
    assert!(sparse.chunk_objects.is_empty());
    // the chunked file is in the head tree, so a working checkout needs all of it
    assert_eq!(ids(&working.chunk_objects), history.chunks.iter().copied().collect());
}

#[tokio::test]
async fn working_checkout_skips_chunks_of_replaced_files() {
    let swarm = Swarm::new();
    let origin = swarm.node("origin");
    let client = swarm.node("client");
    let repo = origin.seed_repo(REPO);
    let history = write_history(&repo);
    origin.grant(REPO, &client);

    // d replaces big.bin with a two-chunk version
    let newer: &[u8] = b"dddddeeeee";
    let big2 = repo.write_chunked_blob(newer, CHUNK_SIZE).unwrap();
    let tree_d = repo
        .write_object(&GitObject::Tree(Tree {
            entries: vec![
                TreeEntry::blob("notes.txt", history.blobs[0]),
                TreeEntry::blob("big.bin", big2),
            ],
        }))
        .unwrap();
    let d = commit(&repo, tree_d, vec![history.head()], "d");

    let fetch = |checkout| {
        let f = client.node.fetcher().clone();
        async move { f.fetch_manifest(REPO, d, checkout, &Shutdown::new()).await.unwrap() }
    };
    let working = bounded(fetch(CheckoutType::Working)).await;
    let full = bounded(fetch(CheckoutType::Full)).await;

    let new_chunks: HashSet<ObjectId> = newer.chunks(CHUNK_SIZE).map(ObjectId::for_chunk).collect();
    assert_eq!(ids(&working.chunk_objects), new_chunks);
    assert_eq!(full.chunk_objects.len(), 5);
    assert!(ids(&working.chunk_objects).is_subset(&ids(&full.chunk_objects)));
}

// ══════════════════════════════════════════════════════════════════════════════
//  Fetch from commit
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn fetch_reconstructs_repo() {
    let swarm = Swarm::new();
    let origin = swarm.node("origin");
    let client = swarm.node("client");
    let history = write_history(&origin.seed_repo(REPO));
    origin.grant(REPO, &client);

    let report = bounded(client.node.fetch(REPO, history.head(), CheckoutType::Full))
        .await
        .unwrap();
    assert_eq!(report.objects, 8);
    assert_eq!(report.chunks, 3);

    let local = client.local_repo(REPO);
    for id in history.git_objects().iter().chain(&history.chunks) {
        assert!(local.has_object(id), "{id} missing after fetch");
    }
    // chunks read back byte-identical
    let rebuilt: Vec<u8> = history
        .chunks
        .iter()
        .flat_map(|c| local.read_raw(c).unwrap().to_vec())
        .collect();
    assert_eq!(rebuilt, BIG);
}

#[tokio::test]
async fn second_fetch_only_moves_new_objects() {
    let swarm = Swarm::new();
    let origin = swarm.node("origin");
    let client = swarm.node("client");
    let repo = origin.seed_repo(REPO);
    let history = write_history(&repo);
    origin.grant(REPO, &client);

    bounded(client.node.fetch(REPO, history.head(), CheckoutType::Full))
        .await
        .unwrap();

    let readme = repo
        .write_object(&GitObject::Blob(bytes::Bytes::from_static(b"readme\n")))
        .unwrap();
    let tree_d = repo
        .write_object(&GitObject::Tree(Tree {
            entries: vec![
                TreeEntry::blob("notes.txt", history.blobs[0]),
                TreeEntry::blob("big.bin", history.blobs[1]),
                TreeEntry::blob("README", readme),
            ],
        }))
        .unwrap();
    let d = commit(&repo, tree_d, vec![history.head()], "d");

    let report = bounded(client.node.fetch(REPO, d, CheckoutType::Full))
        .await
        .unwrap();
    // commit, tree, blob
    assert_eq!(report.objects, 3);
    assert_eq!(report.chunks, 0);
    assert!(client.local_repo(REPO).has_object(&d));
}

#[tokio::test]
async fn objects_are_gathered_from_partial_holders() {
    let swarm = Swarm::new();
    let origin = swarm.node("origin");
    let history = write_history(&origin.seed_repo(REPO));

    // one mirror has the versioned objects, the other only the chunks
    let git_only = swarm.node("git-only");
    let chunks_only = swarm.node("chunks-only");
    let origin_repo = origin.local_repo(REPO);
    copy_objects(
        origin_repo.as_ref(),
        git_only.seed_repo(REPO).as_ref(),
        &history.git_objects(),
    );
    copy_objects(
        origin_repo.as_ref(),
        chunks_only.seed_repo(REPO).as_ref(),
        &history.chunks,
    );
    swarm.net.disconnect(&origin.peer);

    let client = swarm.node("client");
    git_only.grant(REPO, &client);
    chunks_only.grant(REPO, &client);

    let report = bounded(client.node.fetch(REPO, history.head(), CheckoutType::Full))
        .await
        .unwrap();
    assert_eq!(report.objects, 8);
    assert_eq!(report.chunks, 3);
}

#[tokio::test]
async fn fetched_node_serves_others() {
    let swarm = Swarm::new();
    let origin = swarm.node("origin");
    let first = swarm.node("first");
    let second = swarm.node("second");
    let history = write_history(&origin.seed_repo(REPO));
    origin.grant(REPO, &first);

    bounded(first.node.fetch(REPO, history.head(), CheckoutType::Full))
        .await
        .unwrap();
    swarm.net.disconnect(&origin.peer);
    first.grant(REPO, &second);

    let report = bounded(second.node.fetch(REPO, history.head(), CheckoutType::Working))
        .await
        .unwrap();
    assert_eq!(report.objects, 8);
    assert_eq!(report.chunks, 3);
}

#[tokio::test]
async fn single_object_request() {
    let swarm = Swarm::new();
    let origin = swarm.node("origin");
    let client = swarm.node("client");
    let history = write_history(&origin.seed_repo(REPO));
    origin.grant(REPO, &client);

    let raw = bounded(client.node.request_object(origin.peer, REPO, history.blobs[0]))
        .await
        .unwrap()
        .expect("origin has the blob");
    assert_eq!(ObjectId::for_git_object(&raw), history.blobs[0]);
}
