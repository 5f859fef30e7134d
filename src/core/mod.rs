//! Core retrieval pipeline: storage, indexing, ranking, caching and orchestration

/// Approximate nearest-neighbor index over the embedding store.
pub mod ann;
/// Persisted neighbor lists and the latest-batch label file.
pub mod cache;
/// libtorch-backed feature extractor and classifier.
#[cfg(feature = "embeddings")]
pub mod embeddings;
/// Download and verification of model files.
pub mod fetch;
/// Contracts of the external inference collaborators.
pub mod inference;
/// Request orchestration.
pub mod pipeline;
/// Exact similarity scoring of approximate neighbors.
pub mod ranker;
/// Durable per-image feature vector store.
pub mod store;
