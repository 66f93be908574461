//! Manifest construction.
//!
//! Walks a commit's ancestry and trees and yields every object needed to
//! materialize that commit, each exactly once, plus chunk ids as the
//! checkout type demands. The walk is an explicit worklist, so deep
//! histories cost heap rather than stack, and one `seen` set spans the
//! whole walk so trees shared between commits are expanded once.
//!
//! Order: for each commit, the contents of its root tree, then the root
//! tree, then the commit, then its ancestors.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use thiserror::Error;

use swarmgit_core::{CheckoutType, ManifestObject, ManifestObjectSet, ObjectId};

use crate::git::{parse_chunked, EntryKind};
use crate::repo::{RepoError, Repository};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("commit {0} not found")]
    MissingCommit(ObjectId),

    #[error("object {0} not found")]
    MissingObject(ObjectId),

    #[error("blob {id} unreadable: {source}")]
    UnreadableBlob {
        id: ObjectId,
        #[source]
        source: RepoError,
    },

    #[error(transparent)]
    Repo(#[from] RepoError),
}

enum Work {
    Commit(ObjectId),
    Tree { id: ObjectId, in_requested: bool },
    Emit(ManifestObject),
}

/// Iterator over the manifest of one commit.
///
/// Yields `Err` at most once; the walk stops after an error so a partial
/// manifest is never mistaken for a complete one.
pub struct ManifestWalk {
    repo: Arc<dyn Repository>,
    requested: ObjectId,
    checkout: CheckoutType,
    seen: HashSet<ObjectId>,
    seen_chunks: HashSet<ObjectId>,
    work: Vec<Work>,
    ready: VecDeque<ManifestObject>,
    failed: bool,
}

impl ManifestWalk {
    pub fn new(repo: Arc<dyn Repository>, commit: ObjectId, checkout: CheckoutType) -> Self {
        Self {
            repo,
            requested: commit,
            checkout,
            seen: HashSet::new(),
            seen_chunks: HashSet::new(),
            work: vec![Work::Commit(commit)],
            ready: VecDeque::new(),
            failed: false,
        }
    }

    fn wants_chunks(&self, in_requested: bool) -> bool {
        match self.checkout {
            CheckoutType::Sparse => false,
            CheckoutType::Working => in_requested,
            CheckoutType::Full => true,
        }
    }

    fn size_of(&self, id: &ObjectId) -> Result<u64, ManifestError> {
        self.repo
            .object_size(id)?
            .ok_or(ManifestError::MissingObject(*id))
    }

    fn visit_commit(&mut self, id: ObjectId) -> Result<(), ManifestError> {
        if !self.seen.insert(id) {
            return Ok(());
        }
        let commit = match self.repo.read_commit(&id) {
            Ok(c) => c,
            Err(RepoError::NotFound(_)) if id == self.requested => {
                return Err(ManifestError::MissingCommit(id))
            }
            Err(RepoError::NotFound(_)) => return Err(ManifestError::MissingObject(id)),
            Err(e) => return Err(e.into()),
        };

        // Pushed first so they run after this commit is fully emitted.
        for parent in commit.parents.iter().rev() {
            if !self.seen.contains(parent) {
                self.work.push(Work::Commit(*parent));
            }
        }
        self.work.push(Work::Emit(ManifestObject {
            id,
            uncompressed_size: self.size_of(&id)?,
        }));
        if self.seen.insert(commit.tree) {
            self.work.push(Work::Emit(ManifestObject {
                id: commit.tree,
                uncompressed_size: self.size_of(&commit.tree)?,
            }));
            self.work.push(Work::Tree {
                id: commit.tree,
                in_requested: id == self.requested,
            });
        }
        Ok(())
    }

    fn visit_tree(&mut self, id: ObjectId, in_requested: bool) -> Result<(), ManifestError> {
        let tree = self.repo.read_tree(&id)?;
        for entry in tree.entries {
            if !self.seen.insert(entry.id) {
                continue;
            }
            let object = ManifestObject {
                id: entry.id,
                uncompressed_size: self.size_of(&entry.id)?,
            };
            match entry.kind {
                EntryKind::Tree => {
                    self.work.push(Work::Emit(object));
                    self.work.push(Work::Tree {
                        id: entry.id,
                        in_requested,
                    });
                }
                EntryKind::Blob => {
                    self.ready.push_back(object);
                    if self.wants_chunks(in_requested) {
                        self.visit_blob_chunks(entry.id)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn visit_blob_chunks(&mut self, blob: ObjectId) -> Result<(), ManifestError> {
        let body = self
            .repo
            .read_blob(&blob)
            .map_err(|source| ManifestError::UnreadableBlob { id: blob, source })?;
        let Some(chunks) = parse_chunked(&body) else {
            return Ok(());
        };
        for chunk in chunks {
            if !self.seen_chunks.insert(chunk) {
                continue;
            }
            // A chunk this node never received is still part of the manifest.
            let size = self.repo.object_size(&chunk)?.unwrap_or(0);
            self.ready.push_back(ManifestObject {
                id: chunk,
                uncompressed_size: size,
            });
        }
        Ok(())
    }

    fn step(&mut self) -> Result<bool, ManifestError> {
        match self.work.pop() {
            None => Ok(false),
            Some(Work::Commit(id)) => self.visit_commit(id).map(|_| true),
            Some(Work::Tree { id, in_requested }) => self.visit_tree(id, in_requested).map(|_| true),
            Some(Work::Emit(object)) => {
                self.ready.push_back(object);
                Ok(true)
            }
        }
    }
}

impl Iterator for ManifestWalk {
    type Item = Result<ManifestObject, ManifestError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(object) = self.ready.pop_front() {
                return Some(Ok(object));
            }
            if self.failed {
                return None;
            }
            match self.step() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => {
                    self.failed = true;
                    self.ready.clear();
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Run a walk to completion, splitting the result by object kind.
pub fn build_manifest(
    repo: Arc<dyn Repository>,
    commit: ObjectId,
    checkout: CheckoutType,
) -> Result<ManifestObjectSet, ManifestError> {
    let mut set = ManifestObjectSet::default();
    for object in ManifestWalk::new(repo, commit, checkout) {
        set.push(object?);
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::{Commit, GitObject, Tree, TreeEntry};
    use crate::repo::tests::temp_root;
    use crate::repo::LocalRepo;
    use bytes::Bytes;

    fn commit(repo: &LocalRepo, tree: ObjectId, parents: Vec<ObjectId>, msg: &str) -> ObjectId {
        repo.write_object(&GitObject::Commit(Commit {
            tree,
            parents,
            message: msg.into(),
        }))
        .unwrap()
    }

    fn tree(repo: &LocalRepo, entries: Vec<TreeEntry>) -> ObjectId {
        repo.write_object(&GitObject::Tree(Tree { entries })).unwrap()
    }

    fn blob(repo: &LocalRepo, data: &'static [u8]) -> ObjectId {
        repo.write_object(&GitObject::Blob(Bytes::from_static(data)))
            .unwrap()
    }

    fn ids(set: &ManifestObjectSet) -> Vec<ObjectId> {
        set.git_objects
            .iter()
            .chain(set.chunk_objects.iter())
            .map(|o| o.id)
            .collect()
    }

    #[test]
    fn blob_mimicking_the_chunk_header_is_plain() {
        let root = temp_root("manifest-lookalike");
        let repo = LocalRepo::open(&root).unwrap();

        let mut body = crate::git::CHUNKED_HEADER.to_vec();
        body.extend_from_slice(b"docs about the chunk format\n");
        let doc = repo
            .write_object(&GitObject::Blob(Bytes::from(body)))
            .unwrap();
        let t = tree(&repo, vec![TreeEntry::blob("FORMAT.md", doc)]);
        let c = commit(&repo, t, vec![], "docs");

        let repo: Arc<dyn Repository> = Arc::new(repo);
        for checkout in [CheckoutType::Full, CheckoutType::Working] {
            let set = build_manifest(repo.clone(), c, checkout).unwrap();
            assert!(ids(&set).contains(&doc));
            assert!(set.chunk_objects.is_empty());
        }
    }

    #[test]
    fn shared_subtree_walked_once() {
        let root = temp_root("manifest-shared");
        let repo = LocalRepo::open(&root).unwrap();

        let lib = blob(&repo, b"lib");
        let shared = tree(&repo, vec![TreeEntry::blob("lib.rs", lib)]);
        let t1 = tree(&repo, vec![TreeEntry::tree("src", shared)]);
        let c1 = commit(&repo, t1, vec![], "one");
        let readme = blob(&repo, b"readme");
        let t2 = tree(
            &repo,
            vec![
                TreeEntry::tree("src", shared),
                TreeEntry::blob("README", readme),
            ],
        );
        let c2 = commit(&repo, t2, vec![c1], "two");

        let repo: Arc<dyn Repository> = Arc::new(repo);
        let set = build_manifest(repo, c2, CheckoutType::Full).unwrap();
        let all = ids(&set);
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), unique.len(), "no duplicates");
        // c1, c2, t1, t2, shared, lib, readme
        assert_eq!(all.len(), 7);
        assert!(set.chunk_objects.is_empty());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn tree_contents_precede_tree_and_commit() {
        let root = temp_root("manifest-order");
        let repo = LocalRepo::open(&root).unwrap();
        let b = blob(&repo, b"x");
        let t = tree(&repo, vec![TreeEntry::blob("x", b)]);
        let c = commit(&repo, t, vec![], "c");

        let repo: Arc<dyn Repository> = Arc::new(repo);
        let order: Vec<ObjectId> = ManifestWalk::new(repo, c, CheckoutType::Sparse)
            .map(|o| o.unwrap().id)
            .collect();
        assert_eq!(order, vec![b, t, c]);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn sizes_are_encoded_lengths() {
        let root = temp_root("manifest-sizes");
        let repo = LocalRepo::open(&root).unwrap();
        let b = blob(&repo, b"twelve bytes");
        let t = tree(&repo, vec![TreeEntry::blob("f", b)]);
        let c = commit(&repo, t, vec![], "c");
        let expected = repo.object_size(&b).unwrap().unwrap()
            + repo.object_size(&t).unwrap().unwrap()
            + repo.object_size(&c).unwrap().unwrap();

        let repo: Arc<dyn Repository> = Arc::new(repo);
        let set = build_manifest(repo, c, CheckoutType::Full).unwrap();
        assert_eq!(set.git_objects.uncompressed_size(), expected);
        // one type byte on top of the content
        assert_eq!(set.git_objects.0[0].uncompressed_size, 13);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn missing_requested_commit() {
        let root = temp_root("manifest-missing");
        let repo: Arc<dyn Repository> = Arc::new(LocalRepo::open(&root).unwrap());
        let err = build_manifest(repo, ObjectId::Git([3; 20]), CheckoutType::Full).unwrap_err();
        assert!(matches!(err, ManifestError::MissingCommit(_)));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn missing_chunk_reports_zero_size() {
        let root = temp_root("manifest-absent-chunk");
        let repo = LocalRepo::open(&root).unwrap();
        let absent = ObjectId::for_chunk(b"never stored");
        let pointer = repo
            .write_object(&GitObject::Blob(crate::git::chunked_blob(&[absent])))
            .unwrap();
        let t = tree(&repo, vec![TreeEntry::blob("big.bin", pointer)]);
        let c = commit(&repo, t, vec![], "c");

        let repo: Arc<dyn Repository> = Arc::new(repo);
        let set = build_manifest(repo, c, CheckoutType::Full).unwrap();
        assert_eq!(set.chunk_objects.len(), 1);
        assert_eq!(set.chunk_objects.0[0].uncompressed_size, 0);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn unreadable_blob_fails_whole_walk() {
        let root = temp_root("manifest-unreadable");
        let repo = LocalRepo::open(&root).unwrap();
        let good = blob(&repo, b"fine");
        let t = tree(
            &repo,
            vec![
                TreeEntry::blob("fine", good),
                TreeEntry::blob("gone", ObjectId::Git([8; 20])),
            ],
        );
        let c = commit(&repo, t, vec![], "c");

        let repo: Arc<dyn Repository> = Arc::new(repo);
        let results: Vec<_> = ManifestWalk::new(repo, c, CheckoutType::Full).collect();
        assert!(results.last().unwrap().is_err());
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);

        let _ = std::fs::remove_dir_all(&root);
    }
}
