//! Content-addressed object files on disk.
//!
//! A repository keeps two of these:
//!   .git/objects/{hex[0..2]}/{hex}   versioned objects, two-level like git
//!   .git/data/{hex}                  chunks, flat
//!
//! Files are immutable. If the file for an id exists its content is correct,
//! so writes are idempotent and there is no invalidation.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytes::Bytes;
use memmap2::Mmap;

use swarmgit_core::ObjectId;

/// How ids map to file paths under the store root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// `{root}/{hex[0..2]}/{hex}`
    Sharded,
    /// `{root}/{hex}`
    Flat,
}

#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
    layout: Layout,
}

impl ContentStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, layout: Layout) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create store root: {}", root.display()))?;
        Ok(Self { root, layout })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn has(&self, id: &ObjectId) -> bool {
        self.path(id).exists()
    }

    /// On-disk length of the object, if present.
    pub fn size(&self, id: &ObjectId) -> Result<Option<u64>> {
        match fs::metadata(self.path(id)) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to stat object {id}")),
        }
    }

    /// Read an object. Returns None if not present.
    pub fn get(&self, id: &ObjectId) -> Result<Option<Bytes>> {
        let path = self.path(id);
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to open object: {}", path.display()))
            }
        };

        let len = file
            .metadata()
            .with_context(|| format!("failed to stat object: {}", path.display()))?
            .len();
        // mmap of a zero-length file fails on some platforms
        if len == 0 {
            return Ok(Some(Bytes::new()));
        }

        // Safety: opened read-only, files are never rewritten in place
        let mmap = unsafe {
            Mmap::map(&file)
                .with_context(|| format!("failed to mmap object: {}", path.display()))?
        };
        Ok(Some(Bytes::copy_from_slice(&mmap)))
    }

    /// Store an object. Atomic (temp file then rename) and a no-op if present.
    pub fn put(&self, id: &ObjectId, data: &[u8]) -> Result<()> {
        let path = self.path(id);
        if path.exists() {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create store dir: {}", parent.display()))?;
        }

        let tmp_path = path.with_extension(format!("tmp-{}", std::process::id()));
        {
            let mut file = fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;
            file.write_all(data).context("failed to write object data")?;
            file.sync_all().context("failed to sync object to disk")?;
        }

        fs::rename(&tmp_path, &path).with_context(|| {
            format!(
                "failed to rename {} to {}",
                tmp_path.display(),
                path.display()
            )
        })?;

        tracing::trace!(id = %id, "object stored");
        Ok(())
    }

    /// Number of objects in the store.
    pub fn count(&self) -> usize {
        self.files().count()
    }

    /// Total bytes held by the store.
    pub fn total_size(&self) -> u64 {
        self.files()
            .filter_map(|entry| entry.metadata().ok())
            .map(|meta| meta.len())
            .sum()
    }

    fn files(&self) -> impl Iterator<Item = fs::DirEntry> {
        let top: Vec<fs::DirEntry> = fs::read_dir(&self.root)
            .map(|entries| entries.flatten().collect())
            .unwrap_or_default();
        let layout = self.layout;
        top.into_iter().flat_map(move |entry| match layout {
            Layout::Flat => vec![entry],
            Layout::Sharded => fs::read_dir(entry.path())
                .map(|sub| sub.flatten().collect())
                .unwrap_or_default(),
        })
    }

    fn path(&self, id: &ObjectId) -> PathBuf {
        let hex = id.to_hex();
        match self.layout {
            Layout::Sharded => self.root.join(&hex[0..2]).join(&hex),
            Layout::Flat => self.root.join(&hex),
        }
    }
}
