use std::path::{Path, PathBuf};

use crate::core::store::check_identifier;
use crate::error::{AppError, Result};
use crate::models::results::{ClassificationResults, NeighborResult};
use crate::utils::{ensure_dir_exists, write_atomic};

/// Name of the latest-batch label file inside the data directory.
pub const LABELS_FILE: &str = "image_to_labels.json";

/// Persisted neighbor lists, one JSON file per identifier, plus the label
/// file of the most recent batch.
#[derive(Debug, Clone)]
pub struct ResultCache {
    neighbors_dir: PathBuf,
    labels_path: PathBuf,
}

impl ResultCache {
    /// Open a cache storing neighbor lists in `neighbors_dir` and the
    /// latest labels at `labels_path`.
    pub fn open<P: AsRef<Path>, Q: AsRef<Path>>(neighbors_dir: P, labels_path: Q) -> Result<Self> {
        let neighbors_dir = neighbors_dir.as_ref().to_path_buf();
        ensure_dir_exists(&neighbors_dir)?;
        Ok(Self {
            neighbors_dir,
            labels_path: labels_path.as_ref().to_path_buf(),
        })
    }

    /// Path of the neighbor file for `identifier`.
    pub fn path_for(&self, identifier: &str) -> PathBuf {
        self.neighbors_dir.join(format!("{}.json", identifier))
    }

    /// Whether a neighbor list is cached for `identifier`.
    pub async fn has(&self, identifier: &str) -> Result<bool> {
        check_identifier(identifier)?;
        Ok(tokio::fs::try_exists(self.path_for(identifier)).await?)
    }

    /// Persist the neighbor list of `identifier`.
    pub async fn write(&self, identifier: &str, neighbors: &[NeighborResult]) -> Result<()> {
        check_identifier(identifier)?;
        let body = serde_json::to_vec(neighbors)?;
        let path = self.path_for(identifier);
        tokio::task::spawn_blocking(move || write_atomic(&path, &body)).await??;
        Ok(())
    }

    /// Load the neighbor list of `identifier`, or [`AppError::CacheMiss`].
    pub async fn read(&self, identifier: &str) -> Result<Vec<NeighborResult>> {
        check_identifier(identifier)?;
        match tokio::fs::read(self.path_for(identifier)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(AppError::CacheMiss(identifier.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drop the cached neighbor list. Returns whether a file was removed.
    pub async fn remove(&self, identifier: &str) -> Result<bool> {
        check_identifier(identifier)?;
        match tokio::fs::remove_file(self.path_for(identifier)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the latest-batch label file with `results`.
    ///
    /// Earlier batches are not merged in: only the last writer's labels survive.
    pub async fn write_latest_labels(&self, results: &ClassificationResults) -> Result<()> {
        let body = serde_json::to_vec(results)?;
        let path = self.labels_path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &body)).await??;
        Ok(())
    }

    /// Labels of the most recent batch, if any batch has completed.
    pub async fn read_latest_labels(&self) -> Result<Option<ClassificationResults>> {
        match tokio::fs::read(&self.labels_path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
