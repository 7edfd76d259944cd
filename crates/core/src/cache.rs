use crate::error::IngestError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Vision,
    Metadata,
}

impl ArtifactKind {
    fn dir_name(&self) -> &'static str {
        match self {
            ArtifactKind::Vision => "vision",
            ArtifactKind::Metadata => "metadata",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedArtifact<T> {
    pub document_id: String,
    pub page: u32,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub value: T,
}

/// One JSON file per `{document, page, kind}`. The key hashes the document's
/// byte checksum, so an edited PDF misses, and the collection epoch, so a
/// forced recreate misses.
#[derive(Debug, Clone)]
pub struct PageCache {
    root: PathBuf,
    epoch: u64,
}

impl PageCache {
    pub fn new(root: impl Into<PathBuf>, epoch: u64) -> Self {
        Self {
            root: root.into(),
            epoch,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn key(&self, kind: ArtifactKind, checksum: &str, page: u32) -> String {
        let mut hasher = Sha256::new();
        hasher.update(checksum.as_bytes());
        hasher.update(page.to_le_bytes());
        hasher.update(kind.dir_name().as_bytes());
        hasher.update(self.epoch.to_le_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn path(&self, kind: ArtifactKind, checksum: &str, page: u32) -> PathBuf {
        self.root
            .join(kind.dir_name())
            .join(format!("{}.json", self.key(kind, checksum, page)))
    }

    pub async fn load<T: DeserializeOwned>(
        &self,
        kind: ArtifactKind,
        checksum: &str,
        page: u32,
    ) -> Option<CachedArtifact<T>> {
        let path = self.path(kind, checksum, page);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return None,
            Err(error) => {
                warn!(path = %path.display(), %error, "cache artifact unreadable");
                return None;
            }
        };

        match serde_json::from_slice(&raw) {
            Ok(artifact) => Some(artifact),
            Err(error) => {
                warn!(path = %path.display(), %error, "cache artifact corrupt, ignoring");
                None
            }
        }
    }

    pub async fn store<T: Serialize>(
        &self,
        kind: ArtifactKind,
        checksum: &str,
        artifact: &CachedArtifact<T>,
    ) -> Result<PathBuf, IngestError> {
        let path = self.path(kind, checksum, artifact.page);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let encoded = serde_json::to_vec_pretty(artifact)
            .map_err(|error| IngestError::Cache(error.to_string()))?;
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, encoded).await?;
        tokio::fs::rename(&staging, &path).await?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(page: u32, value: &str) -> CachedArtifact<String> {
        CachedArtifact {
            document_id: "doc-1".to_string(),
            page,
            model: "gpt-4o".to_string(),
            created_at: Utc::now(),
            value: value.to_string(),
        }
    }

    #[tokio::test]
    async fn stored_artifact_is_a_hit() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let cache = PageCache::new(dir.path(), 0);
        cache
            .store(ArtifactKind::Vision, "sum", &artifact(3, "analysis"))
            .await?;

        let hit: Option<CachedArtifact<String>> = cache.load(ArtifactKind::Vision, "sum", 3).await;
        assert_eq!(hit.map(|artifact| artifact.value), Some("analysis".to_string()));

        let other_kind: Option<CachedArtifact<String>> =
            cache.load(ArtifactKind::Metadata, "sum", 3).await;
        assert!(other_kind.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn changed_checksum_or_epoch_misses() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let cache = PageCache::new(dir.path(), 0);
        cache
            .store(ArtifactKind::Vision, "sum", &artifact(1, "old"))
            .await?;

        let edited: Option<CachedArtifact<String>> =
            cache.load(ArtifactKind::Vision, "edited", 1).await;
        assert!(edited.is_none());

        let next_epoch = PageCache::new(dir.path(), 1);
        let bumped: Option<CachedArtifact<String>> =
            next_epoch.load(ArtifactKind::Vision, "sum", 1).await;
        assert!(bumped.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_artifact_is_a_miss() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let cache = PageCache::new(dir.path(), 0);
        let path = cache.path(ArtifactKind::Metadata, "sum", 2);
        std::fs::create_dir_all(path.parent().ok_or("no parent")?)?;
        std::fs::write(&path, b"{not json")?;

        let loaded: Option<CachedArtifact<String>> =
            cache.load(ArtifactKind::Metadata, "sum", 2).await;
        assert!(loaded.is_none());
        Ok(())
    }
}
