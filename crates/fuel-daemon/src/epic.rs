//! Epic mirror workflow hooks used by merge-task completion.

use async_trait::async_trait;
use fuel_core::EpicId;
use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum EpicError {
    #[error("Failed to remove mirror {path}: {source}")]
    Cleanup {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[async_trait]
pub trait EpicService: Send + Sync {
    /// Remove the epic's mirror workspace after a successful merge.
    async fn cleanup_mirror(&self, epic: &EpicId) -> Result<(), EpicError>;

    /// Stop scheduling work for the epic.
    async fn pause_epic(&self, epic: &EpicId) -> Result<(), EpicError>;

    /// Whether work belonging to the epic is held back from spawning.
    async fn is_epic_paused(&self, epic: &EpicId) -> bool;

    /// Flag the epic's mirror as needing manual merge.
    async fn mark_merge_failed(&self, epic: &EpicId) -> Result<(), EpicError>;
}

/// Tracks epic flags in memory; mirrors live under `<root>/<epic>`.
pub struct MemoryEpicService {
    mirrors_root: PathBuf,
    paused: RwLock<HashSet<EpicId>>,
    merge_failed: RwLock<HashSet<EpicId>>,
}

impl MemoryEpicService {
    pub fn new(mirrors_root: impl Into<PathBuf>) -> Self {
        Self {
            mirrors_root: mirrors_root.into(),
            paused: RwLock::new(HashSet::new()),
            merge_failed: RwLock::new(HashSet::new()),
        }
    }

    pub fn mirror_path(&self, epic: &EpicId) -> PathBuf {
        self.mirrors_root.join(epic.as_str())
    }

    pub async fn is_merge_failed(&self, epic: &EpicId) -> bool {
        self.merge_failed.read().await.contains(epic)
    }
}

#[async_trait]
impl EpicService for MemoryEpicService {
    async fn cleanup_mirror(&self, epic: &EpicId) -> Result<(), EpicError> {
        let path = self.mirror_path(epic);
        if tokio::fs::metadata(&path).await.is_err() {
            return Ok(());
        }
        tokio::fs::remove_dir_all(&path)
            .await
            .map_err(|source| EpicError::Cleanup {
                path: path.clone(),
                source,
            })?;
        self.merge_failed.write().await.remove(epic);
        info!(epic_id = %epic, path = %path.display(), "Removed epic mirror");
        Ok(())
    }

    async fn pause_epic(&self, epic: &EpicId) -> Result<(), EpicError> {
        self.paused.write().await.insert(epic.clone());
        warn!(epic_id = %epic, "Epic paused");
        Ok(())
    }

    async fn is_epic_paused(&self, epic: &EpicId) -> bool {
        self.paused.read().await.contains(epic)
    }

    async fn mark_merge_failed(&self, epic: &EpicId) -> Result<(), EpicError> {
        self.merge_failed.write().await.insert(epic.clone());
        warn!(epic_id = %epic, "Epic mirror marked merge-failed");
        Ok(())
    }
}
