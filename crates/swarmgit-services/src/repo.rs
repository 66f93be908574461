//! Repository storage: the object database the protocols read and write.
//!
//! [`Repository`] is the seam the protocol servers, the manifest walk and
//! fetch ingestion work against. [`LocalRepo`] keeps a repository on disk;
//! [`RepoSet`] maps repo ids to the repositories this node holds.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;

use swarmgit_core::{ObjectId, ObjectKind};

use crate::git::{chunked_blob, Commit, GitObject, Tree};
use crate::store::{ContentStore, Layout};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("object {0} not found")]
    NotFound(ObjectId),

    #[error("object {id} does not match its content")]
    Corrupt { id: ObjectId },

    #[error("object {id} is a {found}, expected a {expected}")]
    WrongType {
        id: ObjectId,
        expected: &'static str,
        found: &'static str,
    },

    #[error("malformed object: {0}")]
    Decode(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Object database for one repository.
///
/// Reads of committed objects are safe from many tasks at once. Writes are
/// idempotent and verify the content against the id.
pub trait Repository: Send + Sync {
    fn has_object(&self, id: &ObjectId) -> bool;

    /// Encoded size of an object (raw form for versioned objects, file length for chunks).
    fn object_size(&self, id: &ObjectId) -> Result<Option<u64>, RepoError>;

    fn read_raw(&self, id: &ObjectId) -> Result<Bytes, RepoError>;

    /// Store raw bytes under `id`, rejecting bytes that hash to something else.
    fn write_raw(&self, id: &ObjectId, data: &[u8]) -> Result<(), RepoError>;

    fn read_object(&self, id: &ObjectId) -> Result<GitObject, RepoError> {
        GitObject::decode(&self.read_raw(id)?)
    }

    fn read_commit(&self, id: &ObjectId) -> Result<Commit, RepoError> {
        match self.read_object(id)? {
            GitObject::Commit(c) => Ok(c),
            other => Err(wrong_type(id, "commit", &other)),
        }
    }

    fn read_tree(&self, id: &ObjectId) -> Result<Tree, RepoError> {
        match self.read_object(id)? {
            GitObject::Tree(t) => Ok(t),
            other => Err(wrong_type(id, "tree", &other)),
        }
    }

    fn read_blob(&self, id: &ObjectId) -> Result<Bytes, RepoError> {
        match self.read_object(id)? {
            GitObject::Blob(b) => Ok(b),
            other => Err(wrong_type(id, "blob", &other)),
        }
    }
}

fn wrong_type(id: &ObjectId, expected: &'static str, found: &GitObject) -> RepoError {
    let found = match found {
        GitObject::Commit(_) => "commit",
        GitObject::Tree(_) => "tree",
        GitObject::Blob(_) => "blob",
    };
    RepoError::WrongType {
        id: *id,
        expected,
        found,
    }
}

/// Check that `data` is the content `id` names.
pub fn verify_content(id: &ObjectId, data: &[u8]) -> Result<(), RepoError> {
    let actual = match id.kind() {
        ObjectKind::Git => ObjectId::for_git_object(data),
        ObjectKind::Chunk => ObjectId::for_chunk(data),
    };
    if actual != *id {
        return Err(RepoError::Corrupt { id: *id });
    }
    Ok(())
}

// ── On-disk repository ───────────────────────────────────────────────────────

/// A repository laid out under `{root}/.git`.
#[derive(Debug, Clone)]
pub struct LocalRepo {
    root: PathBuf,
    objects: ContentStore,
    chunks: ContentStore,
}

impl LocalRepo {
    /// Open the repository at `root`, creating its directories if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, RepoError> {
        let root = root.into();
        let git_dir = root.join(".git");
        Ok(Self {
            objects: ContentStore::new(git_dir.join("objects"), Layout::Sharded)?,
            chunks: ContentStore::new(git_dir.join("data"), Layout::Flat)?,
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn store(&self, id: &ObjectId) -> &ContentStore {
        match id.kind() {
            ObjectKind::Git => &self.objects,
            ObjectKind::Chunk => &self.chunks,
        }
    }

    pub fn write_object(&self, object: &GitObject) -> Result<ObjectId, RepoError> {
        let raw = object.encode();
        let id = ObjectId::for_git_object(&raw);
        self.objects.put(&id, &raw)?;
        Ok(id)
    }

    pub fn write_chunk(&self, data: &[u8]) -> Result<ObjectId, RepoError> {
        let id = ObjectId::for_chunk(data);
        self.chunks.put(&id, data)?;
        Ok(id)
    }

    /// Split `data` into chunks of `chunk_size` bytes, store them, and store
    /// the pointer blob that references them. Returns the blob id.
    pub fn write_chunked_blob(&self, data: &[u8], chunk_size: usize) -> Result<ObjectId, RepoError> {
        let chunk_size = chunk_size.max(1);
        let ids = data
            .chunks(chunk_size)
            .map(|piece| self.write_chunk(piece))
            .collect::<Result<Vec<_>, _>>()?;
        self.write_object(&GitObject::Blob(chunked_blob(&ids)))
    }

    /// Versioned objects and chunks held, for stats.
    pub fn counts(&self) -> (usize, usize) {
        (self.objects.count(), self.chunks.count())
    }
}

impl Repository for LocalRepo {
    fn has_object(&self, id: &ObjectId) -> bool {
        self.store(id).has(id)
    }

    fn object_size(&self, id: &ObjectId) -> Result<Option<u64>, RepoError> {
        Ok(self.store(id).size(id)?)
    }

    fn read_raw(&self, id: &ObjectId) -> Result<Bytes, RepoError> {
        self.store(id).get(id)?.ok_or(RepoError::NotFound(*id))
    }

    fn write_raw(&self, id: &ObjectId, data: &[u8]) -> Result<(), RepoError> {
        verify_content(id, data)?;
        self.store(id).put(id, data)?;
        Ok(())
    }
}

// ── Repo set ─────────────────────────────────────────────────────────────────

/// Repositories held by this node, keyed by repo id.
///
/// Clones share the same map.
#[derive(Clone)]
pub struct RepoSet {
    root: PathBuf,
    repos: Arc<DashMap<String, Arc<dyn Repository>>>,
}

impl RepoSet {
    /// Repositories created on demand live under `root/{repo_id}`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            repos: Arc::new(DashMap::new()),
        }
    }

    pub fn insert(&self, repo_id: impl Into<String>, repo: Arc<dyn Repository>) {
        self.repos.insert(repo_id.into(), repo);
    }

    pub fn get(&self, repo_id: &str) -> Option<Arc<dyn Repository>> {
        self.repos.get(repo_id).map(|r| r.value().clone())
    }

    pub fn contains(&self, repo_id: &str) -> bool {
        self.repos.contains_key(repo_id)
    }

    /// The repository for `repo_id`, opening one on disk if none is held yet.
    pub fn get_or_open(&self, repo_id: &str) -> Result<Arc<dyn Repository>, RepoError> {
        if let Some(repo) = self.get(repo_id) {
            return Ok(repo);
        }
        let repo: Arc<dyn Repository> = Arc::new(LocalRepo::open(self.root.join(repo_id))?);
        Ok(self
            .repos
            .entry(repo_id.to_string())
            .or_insert(repo)
            .value()
            .clone())
    }

    /// Open every repository already on disk under the root. Returns how many were found.
    ///
    /// A repository is any directory (up to two levels deep, so `owner/name`
    /// ids work) containing a `.git` directory.
    pub fn load_existing(&self) -> Result<usize, RepoError> {
        let mut found = 0;
        for repo_id in scan_repo_ids(&self.root) {
            self.get_or_open(&repo_id)?;
            found += 1;
        }
        if found > 0 {
            tracing::info!(count = found, root = %self.root.display(), "loaded repositories");
        }
        Ok(found)
    }

    pub fn ids(&self) -> Vec<String> {
        self.repos.iter().map(|e| e.key().clone()).collect()
    }
}

fn scan_repo_ids(root: &Path) -> Vec<String> {
    let mut ids = Vec::new();
    let Ok(entries) = std::fs::read_dir(root) else {
        return ids;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if path.join(".git").is_dir() {
            ids.push(name);
            continue;
        }
        if let Ok(nested) = std::fs::read_dir(&path) {
            for sub in nested.flatten() {
                if sub.path().join(".git").is_dir() {
                    ids.push(format!("{}/{}", name, sub.file_name().to_string_lossy()));
                }
            }
        }
    }
    ids
}
