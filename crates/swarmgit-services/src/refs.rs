//! Ref registry: where a repo's current head commit is published.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use swarmgit_core::ObjectId;

#[async_trait]
pub trait RefRegistry: Send + Sync {
    /// Head commit of `repo_id`, or None if the repo has never been pushed.
    async fn head(&self, repo_id: &str) -> anyhow::Result<Option<ObjectId>>;
}

/// In-memory registry. Clones share the same table.
#[derive(Clone, Default)]
pub struct MemoryRefs {
    heads: Arc<DashMap<String, ObjectId>>,
}

impl MemoryRefs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_head(&self, repo_id: impl Into<String>, commit: ObjectId) {
        let repo_id = repo_id.into();
        tracing::debug!(repo = %repo_id, %commit, "head updated");
        self.heads.insert(repo_id, commit);
    }
}

#[async_trait]
impl RefRegistry for MemoryRefs {
    async fn head(&self, repo_id: &str) -> anyhow::Result<Option<ObjectId>> {
        Ok(self.heads.get(repo_id).map(|c| *c.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn head_tracks_latest_set() {
        let refs = MemoryRefs::new();
        assert_eq!(refs.head("r").await.unwrap(), None);
        refs.set_head("r", ObjectId::Git([1; 20]));
        refs.set_head("r", ObjectId::Git([2; 20]));
        assert_eq!(refs.head("r").await.unwrap(), Some(ObjectId::Git([2; 20])));
    }
}
