//! Per-request orchestration: extraction, classification, storage, index
//! rebuild, ranking and caching.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError};
use std::time::Instant;

use bytes::Bytes;
use futures::future::join_all;
use tokio::sync::{OwnedMutexGuard, RwLock, Semaphore};
use uuid::Uuid;

use crate::core::ann::AnnIndexBuilder;
use crate::core::cache::{ResultCache, LABELS_FILE};
use crate::core::inference::{Classifier, FaceDetector, FeatureExtractor};
use crate::core::ranker::SimilarityRanker;
use crate::core::store::EmbeddingStore;
use crate::error::{AppError, Result};
use crate::models::embedding::FeatureVector;
use crate::models::results::{ClassificationResults, ImageClassification, SimilarityResponse};
use crate::state::{Config, PipelineConfig};
use crate::utils::{ensure_dir_exists, identifier_from_filename};

/// Sub-directory of the data dir holding feature vectors.
pub const VECTORS_DIR: &str = "image_vectors";
/// Sub-directory of the data dir holding cached neighbor lists.
pub const NEIGHBORS_DIR: &str = "nearest_neighbors";

/// An uploaded image whose filename has already been sanitized.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    /// Safe flat filename, extension included.
    pub filename: String,
    /// Encoded image data.
    pub bytes: Bytes,
}

impl ImageUpload {
    /// Creates an upload.
    pub fn new(filename: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            filename: filename.into(),
            bytes: bytes.into(),
        }
    }

    /// Identifier the image is stored under.
    pub fn identifier(&self) -> &str {
        identifier_from_filename(&self.filename)
    }
}

/// Why an image contributed nothing to a batch.
#[derive(Debug)]
pub enum SkipReason {
    /// An embedding already exists; nothing was recomputed.
    AlreadyStored,
    /// Extraction, classification or storage failed.
    Failed(AppError),
}

/// Result of one image within a batch.
#[derive(Debug)]
pub enum ImageOutcome {
    /// Embedding stored and labels collected.
    Processed(ImageClassification),
    /// Image left out of the results.
    Skipped {
        /// Identifier of the skipped image.
        identifier: String,
        /// Why it was skipped.
        reason: SkipReason,
    },
}

/// Outcomes of a batch, in input order.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// One outcome per submitted image.
    pub outcomes: Vec<ImageOutcome>,
}

impl BatchReport {
    /// Successfully processed images.
    pub fn processed(&self) -> impl Iterator<Item = &ImageClassification> {
        self.outcomes.iter().filter_map(|o| match o {
            ImageOutcome::Processed(c) => Some(c),
            ImageOutcome::Skipped { .. } => None,
        })
    }

    /// Skipped images and the reason for each.
    pub fn skipped(&self) -> impl Iterator<Item = (&str, &SkipReason)> {
        self.outcomes.iter().filter_map(|o| match o {
            ImageOutcome::Skipped { identifier, reason } => Some((identifier.as_str(), reason)),
            ImageOutcome::Processed(_) => None,
        })
    }

    /// The processed images in their compatibility shape.
    pub fn classification_results(&self) -> ClassificationResults {
        ClassificationResults::from_images(self.processed())
    }
}

/// One async lock per identifier, dropped once nobody holds or awaits it.
#[derive(Debug, Default)]
struct IdentifierLocks {
    inner: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl IdentifierLocks {
    async fn lock(&self, identifier: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.retain(|_, l| Arc::strong_count(l) > 1);
            Arc::clone(map.entry(identifier.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Lock several identifiers in sorted order so overlapping batches cannot deadlock.
    async fn lock_all<'a, I>(&self, identifiers: I) -> Vec<OwnedMutexGuard<()>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut ids: Vec<&str> = identifiers.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();

        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.lock(id).await);
        }
        guards
    }
}

/// Image on disk for the duration of one request.
struct StagedImage {
    identifier: String,
    path: PathBuf,
    bytes: Bytes,
}

/// Drives a request from raw upload to assembled response.
pub struct Pipeline {
    config: PipelineConfig,
    upload_dir: PathBuf,
    store: EmbeddingStore,
    cache: ResultCache,
    extractor: Arc<dyn FeatureExtractor>,
    classifier: Arc<dyn Classifier>,
    detector: Arc<dyn FaceDetector>,
    index_builder: AnnIndexBuilder,
    ranker: SimilarityRanker,
    // Store mutations take the write side, snapshot + build + rank the read side.
    corpus: RwLock<()>,
    identifier_locks: IdentifierLocks,
    workers: Arc<Semaphore>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("cache", &self.cache)
            .field("upload_dir", &self.upload_dir)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Open the store and cache under `config.data_dir` and wire the collaborators.
    pub fn new(
        config: &Config,
        extractor: Arc<dyn FeatureExtractor>,
        classifier: Arc<dyn Classifier>,
        detector: Arc<dyn FaceDetector>,
    ) -> Result<Self> {
        config.validate()?;
        let data_dir = &config.data_dir;
        let store = EmbeddingStore::open(data_dir.join(VECTORS_DIR))?;
        let cache = ResultCache::open(data_dir.join(NEIGHBORS_DIR), data_dir.join(LABELS_FILE))?;
        ensure_dir_exists(&config.upload_dir)?;

        let pipeline = &config.pipeline;
        Ok(Self {
            config: pipeline.clone(),
            upload_dir: config.upload_dir.clone(),
            store,
            cache,
            extractor,
            classifier,
            detector,
            index_builder: AnnIndexBuilder::new(pipeline.ef_construction)
                .with_ef_search(pipeline.ef_search),
            ranker: SimilarityRanker::new(pipeline.n_nearest_neighbors),
            corpus: RwLock::new(()),
            identifier_locks: IdentifierLocks::default(),
            workers: Arc::new(Semaphore::new(pipeline.workers)),
        })
    }

    /// Replace the index builder, e.g. to pin a seed.
    pub fn with_index_builder(mut self, builder: AnnIndexBuilder) -> Self {
        self.index_builder = builder;
        self
    }

    /// The embedding store.
    pub fn store(&self) -> &EmbeddingStore {
        &self.store
    }

    /// The result cache.
    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Pipeline settings.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Handle one uploaded image end to end.
    ///
    /// A previously stored identifier skips extraction and classification;
    /// its labels then come from the latest-batch label file. Neighbors are
    /// ranked against the current store on every call. Unless
    /// artifacts are retained, the identifier's vector and neighbor files are
    /// deleted once the response is assembled.
    pub async fn process(&self, upload: ImageUpload) -> Result<SimilarityResponse> {
        let start = Instant::now();
        let identifier = upload.identifier().to_string();
        if identifier.is_empty() {
            return Err(AppError::UploadError(format!(
                "cannot derive an identifier from {:?}",
                upload.filename
            )));
        }
        let _guard = self.identifier_locks.lock(&identifier).await;
        log::info!("Processing {} as {}", upload.filename, identifier);

        let classification = if self.store.exists(&identifier).await? {
            log::info!("Embedding for {} already stored, skipping extraction", identifier);
            self.cache.read_latest_labels().await?.unwrap_or_default()
        } else {
            self.run_batch(vec![upload]).await?.classification_results()
        };

        // Neighbors reflect the store as of this request, even on a dedup hit.
        self.rank_and_cache(&identifier).await?;
        let neighbors = self.cache.read(&identifier).await?;
        let response = SimilarityResponse(neighbors, classification);

        if !self.config.retain_artifacts {
            self.cleanup(&identifier).await;
        }

        log::info!(
            "Finished {} in {:.3}s ({} neighbors)",
            identifier,
            start.elapsed().as_secs_f64(),
            response.neighbors().len()
        );
        Ok(response)
    }

    /// Classify and store a batch of images, skipping failures.
    ///
    /// Identifiers that already have an embedding are reported as
    /// [`SkipReason::AlreadyStored`] and not recomputed. The latest-batch
    /// label file is replaced with this batch's results.
    pub async fn classify_batch(&self, uploads: Vec<ImageUpload>) -> Result<BatchReport> {
        let identifiers: Vec<String> = uploads.iter().map(|u| u.identifier().to_string()).collect();
        let _guards = self
            .identifier_locks
            .lock_all(identifiers.iter().map(String::as_str))
            .await;

        let mut fresh = Vec::with_capacity(uploads.len());
        let mut stored = Vec::new();
        for (slot, upload) in uploads.into_iter().enumerate() {
            let id = upload.identifier();
            if !id.is_empty() && self.store.exists(id).await? {
                stored.push(slot);
            } else {
                fresh.push((slot, upload));
            }
        }

        let (slots, fresh): (Vec<usize>, Vec<ImageUpload>) = fresh.into_iter().unzip();
        let report = self.run_batch(fresh).await?;

        let mut outcomes: Vec<Option<ImageOutcome>> = (0..identifiers.len()).map(|_| None).collect();
        for slot in stored {
            outcomes[slot] = Some(ImageOutcome::Skipped {
                identifier: identifiers[slot].clone(),
                reason: SkipReason::AlreadyStored,
            });
        }
        for (slot, outcome) in slots.into_iter().zip(report.outcomes) {
            outcomes[slot] = Some(outcome);
        }

        Ok(BatchReport {
            outcomes: outcomes.into_iter().flatten().collect(),
        })
    }

    /// Extraction, classification and detection for every upload, then
    /// storage of the successes. Callers hold the identifier locks.
    async fn run_batch(&self, uploads: Vec<ImageUpload>) -> Result<BatchReport> {
        let request_dir = self.upload_dir.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&request_dir).await?;

        let mut staged = Vec::with_capacity(uploads.len());
        for upload in uploads {
            let path = request_dir.join(&upload.filename);
            tokio::fs::write(&path, &upload.bytes).await?;
            staged.push(StagedImage {
                identifier: upload.identifier().to_string(),
                path,
                bytes: upload.bytes,
            });
        }

        let results = join_all(staged.iter().map(|image| self.process_image(image))).await;

        let mut report = BatchReport::default();
        {
            let _corpus = self.corpus.write().await;
            for (image, result) in staged.iter().zip(results) {
                let stored = match result {
                    Ok((classification, vector)) => self
                        .store
                        .put(&image.identifier, &vector)
                        .await
                        .map(|()| classification),
                    Err(e) => Err(e),
                };
                report.outcomes.push(match stored {
                    Ok(classification) => ImageOutcome::Processed(classification),
                    Err(e) => {
                        if e.is_per_image() {
                            log::warn!("Could not process image {}: {}", image.identifier, e);
                        } else {
                            log::error!("Could not process image {}: {}", image.identifier, e);
                        }
                        ImageOutcome::Skipped {
                            identifier: image.identifier.clone(),
                            reason: SkipReason::Failed(e),
                        }
                    }
                });
            }
        }

        if let Err(e) = tokio::fs::remove_dir_all(&request_dir).await {
            log::warn!("Could not remove {}: {}", request_dir.display(), e);
        }

        self.cache
            .write_latest_labels(&report.classification_results())
            .await?;
        log::debug!(
            "Batch done: {} processed, {} skipped",
            report.processed().count(),
            report.skipped().count()
        );
        Ok(report)
    }

    async fn process_image(&self, image: &StagedImage) -> Result<(ImageClassification, FeatureVector)> {
        if image.identifier.is_empty() {
            return Err(AppError::UploadError(format!(
                "no identifier for {}",
                image.path.display()
            )));
        }

        let extractor = Arc::clone(&self.extractor);
        let bytes = image.bytes.clone();
        let vector = self
            .call_with_retry("extraction", move || extractor.extract(&bytes))
            .await?;
        if vector.len() != self.config.dims {
            return Err(AppError::DimensionMismatch {
                identifier: image.identifier.clone(),
                expected: self.config.dims,
                found: vector.len(),
            });
        }

        let classifier = Arc::clone(&self.classifier);
        let bytes = image.bytes.clone();
        let top_k = self.config.num_top_predictions;
        let labels = self
            .call_with_retry("classification", move || classifier.classify(&bytes, top_k))
            .await?;

        let detector = Arc::clone(&self.detector);
        let path = image.path.clone();
        let face_count = match self.call_blocking(move || detector.detect(&path)).await {
            Ok(count) => count,
            Err(e @ (AppError::Detection(_) | AppError::Timeout(_))) => {
                log::warn!("Face detection failed for {}, counting 0: {}", image.identifier, e);
                0
            }
            Err(e) => return Err(e),
        };

        Ok((
            ImageClassification {
                identifier: image.identifier.clone(),
                labels,
                face_count,
            },
            vector,
        ))
    }

    /// Rebuild the index over the whole store, rank `identifier` and cache the result.
    async fn rank_and_cache(&self, identifier: &str) -> Result<()> {
        let _corpus = self.corpus.read().await;
        let records = self.store.list_all().await?;
        let started = Instant::now();
        let corpus_size = records.len();

        let builder = self.index_builder.clone();
        let ranker = self.ranker;
        let query = identifier.to_string();
        let neighbors = tokio::task::spawn_blocking(move || {
            let index = builder.build(&records)?;
            ranker.rank(&index, &records, &query)
        })
        .await??;

        log::info!(
            "Ranked {} against {} embeddings in {:.3}s",
            identifier,
            corpus_size,
            started.elapsed().as_secs_f64()
        );
        self.cache.write(identifier, &neighbors).await
    }

    async fn cleanup(&self, identifier: &str) {
        let _corpus = self.corpus.write().await;
        if let Err(e) = self.store.remove(identifier).await {
            log::warn!("Could not remove embedding for {}: {}", identifier, e);
        }
        if let Err(e) = self.cache.remove(identifier).await {
            log::warn!("Could not remove cached neighbors for {}: {}", identifier, e);
        }
    }

    async fn call_with_retry<T, F>(&self, what: &'static str, f: F) -> Result<T>
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let f = Arc::new(f);
        let mut attempt = 0;
        loop {
            let call = Arc::clone(&f);
            match self.call_blocking(move || (*call)()).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.config.extraction_retries => {
                    attempt += 1;
                    log::debug!("Retrying {} (attempt {}): {}", what, attempt + 1, e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run a blocking model call on the bounded worker pool under the request timeout.
    ///
    /// A call that times out keeps its thread and its worker permit until it
    /// returns on its own.
    async fn call_blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.workers)
            .acquire_owned()
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
        let call = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        });

        match tokio::time::timeout(self.config.timeout, call).await {
            Ok(joined) => joined?,
            Err(_) => Err(AppError::Timeout(self.config.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_identifier_locks_are_pruned() {
        let locks = IdentifierLocks::default();
        {
            let _a = locks.lock("a").await;
            let _b = locks.lock("b").await;
            assert_eq!(locks.inner.lock().unwrap().len(), 2);
        }
        let _c = locks.lock("c").await;
        let map = locks.inner.lock().unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("c"));
    }

    #[tokio::test]
    async fn test_identifier_lock_serializes_holders() {
        let locks = Arc::new(IdentifierLocks::default());
        let guard = locks.lock("cat").await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _g = locks.lock("cat").await;
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_all_dedups() {
        let locks = IdentifierLocks::default();
        let guards = locks.lock_all(["b", "a", "b"]).await;
        assert_eq!(guards.len(), 2);
    }

    #[test]
    fn test_report_conversion() {
        let report = BatchReport {
            outcomes: vec![
                ImageOutcome::Processed(ImageClassification {
                    identifier: "a".into(),
                    labels: vec![],
                    face_count: 1,
                }),
                ImageOutcome::Skipped {
                    identifier: "b".into(),
                    reason: SkipReason::AlreadyStored,
                },
            ],
        };
        assert_eq!(report.processed().count(), 1);
        assert_eq!(report.skipped().map(|(id, _)| id).collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(report.classification_results().number_of_faces, vec![1]);
    }
}
