use std::path::{Path, PathBuf};

use futures::TryStreamExt;
use tokio_stream::wrappers::ReadDirStream;

use crate::error::{AppError, Result};
use crate::models::embedding::{EmbeddingRecord, FeatureVector};
use crate::utils::{ensure_dir_exists, write_atomic};

/// File extension of a stored feature vector.
pub const VECTOR_EXTENSION: &str = "vec";

/// Durable one-file-per-image feature vector store.
///
/// Each vector lives in `<dir>/<identifier>.vec` as text, one component per
/// line. Writes replace the file atomically, so a concurrent listing never
/// observes half a vector.
#[derive(Debug, Clone)]
pub struct EmbeddingStore {
    dir: PathBuf,
}

impl EmbeddingStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        ensure_dir_exists(&dir)?;
        Ok(Self { dir })
    }

    /// Directory backing the store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the vector file for `identifier`.
    pub fn path_for(&self, identifier: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", identifier, VECTOR_EXTENSION))
    }

    /// Write `vector` under `identifier`, replacing any previous content.
    pub async fn put(&self, identifier: &str, vector: &[f32]) -> Result<()> {
        check_identifier(identifier)?;
        let mut body = String::with_capacity(vector.len() * 26);
        for value in vector {
            body.push_str(&format!("{:.18e}\n", value));
        }

        let path = self.path_for(identifier);
        tokio::task::spawn_blocking(move || write_atomic(&path, body.as_bytes())).await??;
        log::debug!("Stored {}-d vector for {}", vector.len(), identifier);
        Ok(())
    }

    /// Read the vector stored under `identifier`.
    pub async fn get(&self, identifier: &str) -> Result<FeatureVector> {
        check_identifier(identifier)?;
        let path = self.path_for(identifier);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => parse_vector(&path, &text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(AppError::NotFound(format!("embedding for {}", identifier)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a vector is stored under `identifier`.
    pub async fn exists(&self, identifier: &str) -> Result<bool> {
        check_identifier(identifier)?;
        Ok(tokio::fs::try_exists(self.path_for(identifier)).await?)
    }

    /// Every stored record, ordered by identifier.
    pub async fn list_all(&self) -> Result<Vec<EmbeddingRecord>> {
        let entries = ReadDirStream::new(tokio::fs::read_dir(&self.dir).await?);
        let paths: Vec<PathBuf> = entries
            .map_ok(|entry| entry.path())
            .try_filter(|path| {
                let is_vector = path.extension().and_then(|e| e.to_str()) == Some(VECTOR_EXTENSION);
                futures::future::ready(is_vector)
            })
            .try_collect()
            .await?;

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            let identifier = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| AppError::CorruptVector {
                    path: path.display().to_string(),
                    reason: "file name is not valid UTF-8".to_string(),
                })?
                .to_string();
            let text = tokio::fs::read_to_string(&path).await?;
            records.push(EmbeddingRecord::new(identifier, parse_vector(&path, &text)?));
        }
        records.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        Ok(records)
    }

    /// Delete the vector for `identifier`. Returns whether a file was removed.
    pub async fn remove(&self, identifier: &str) -> Result<bool> {
        check_identifier(identifier)?;
        match tokio::fs::remove_file(self.path_for(identifier)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Identifiers become file names; reject anything that could escape the store.
pub(crate) fn check_identifier(identifier: &str) -> Result<()> {
    if identifier.is_empty()
        || identifier.contains(['/', '\\'])
        || identifier == "."
        || identifier == ".."
    {
        return Err(AppError::InvalidInput(format!("bad identifier {:?}", identifier)));
    }
    Ok(())
}

fn parse_vector(path: &Path, text: &str) -> Result<FeatureVector> {
    let corrupt = |reason: String| AppError::CorruptVector {
        path: path.display().to_string(),
        reason,
    };

    let vector = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(i, line)| {
            line.parse::<f32>()
                .map_err(|e| corrupt(format!("line {}: {}", i + 1, e)))
        })
        .collect::<Result<FeatureVector>>()?;

    if vector.is_empty() {
        return Err(corrupt("no components".to_string()));
    }
    Ok(vector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_exists() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmbeddingStore::open(dir.path()).unwrap();

        assert!(!store.exists("cat").await.unwrap());
        store.put("cat", &[0.5, -1.25, 3.0]).await.unwrap();
        assert!(store.exists("cat").await.unwrap());
        assert_eq!(store.get("cat").await.unwrap(), vec![0.5, -1.25, 3.0]);
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmbeddingStore::open(dir.path()).unwrap();

        store.put("cat", &[1.0, 2.0]).await.unwrap();
        store.put("cat", &[3.0, 4.0]).await.unwrap();
        assert_eq!(store.get("cat").await.unwrap(), vec![3.0, 4.0]);
        assert_eq!(store.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_all_is_sorted_and_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmbeddingStore::open(dir.path()).unwrap();
        store.put("b", &[2.0]).await.unwrap();
        store.put("a", &[1.0]).await.unwrap();
        store.put("c", &[3.0]).await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();

        let ids: Vec<String> = store
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.identifier)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmbeddingStore::open(dir.path()).unwrap();
        store.put("good", &[1.0]).await.unwrap();
        std::fs::write(store.path_for("bad"), "1.0\nnot-a-number\n").unwrap();

        let err = store.list_all().await.unwrap_err();
        assert!(matches!(err, AppError::CorruptVector { .. }));
        assert!(matches!(store.get("bad").await, Err(AppError::CorruptVector { .. })));
    }

    #[tokio::test]
    async fn test_missing_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmbeddingStore::open(dir.path()).unwrap();

        assert!(matches!(store.get("ghost").await, Err(AppError::NotFound(_))));
        store.put("cat", &[1.0]).await.unwrap();
        assert!(store.remove("cat").await.unwrap());
        assert!(!store.remove("cat").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_path_like_identifiers() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmbeddingStore::open(dir.path()).unwrap();
        assert!(matches!(store.put("../x", &[1.0]).await, Err(AppError::InvalidInput(_))));
        assert!(matches!(store.exists("").await, Err(AppError::InvalidInput(_))));
    }
}
