#![doc(html_root_url = "https://docs.rs/imagenn/0.1.0")]
#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

//! # imagenn
//!
//! An image similarity service: every uploaded image is turned into a deep
//! feature embedding and a set of predicted labels, and answered with the
//! most visually similar images seen so far.
//!
//! ## Features
//!
//! - **Embedding Store**: one durable feature vector file per image
//! - **ANN Index**: HNSW graph rebuilt over the whole store
//! - **Similarity Ranking**: exact cosine similarity, truncated to 4 decimals
//! - **Result Cache**: neighbor lists per image and labels of the latest batch
//! - **Pipeline**: deduplication, per-image failure isolation, bounded model workers
//! - **Web API**: `POST /api` multipart upload returning `[neighbors, labels]`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use imagenn::core::inference::NullFaceDetector;
//! use imagenn::{Config, ImageUpload, Pipeline, Result, TchModel};
//!
//! # async fn run() -> Result<()> {
//! let config = Config::from_env()?;
//! let model = Arc::new(TchModel::load(&config.model)?);
//! let pipeline = Pipeline::new(&config, model.clone(), model, Arc::new(NullFaceDetector))?;
//!
//! let bytes = std::fs::read("cat.jpg")?;
//! let response = pipeline.process(ImageUpload::new("cat.jpg", bytes)).await?;
//! println!("{}", serde_json::to_string(&response)?);
//! # Ok(())
//! # }
//! ```

// Internal modules
pub mod api;
pub mod core;
/// Defines the application's error types and result aliases.
pub mod error;
pub mod models;
mod state;
mod utils;

/// Build-time metadata generated by `built`.
#[allow(dead_code, missing_docs, unreachable_pub)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

use std::sync::Arc;

// Public API exports
pub use crate::{
    core::{
        ann::{AnnIndex, AnnIndexBuilder, HnswIndex},
        cache::ResultCache,
        inference::{Classifier, CommandFaceDetector, FaceDetector, FeatureExtractor, NullFaceDetector},
        pipeline::{BatchReport, ImageOutcome, ImageUpload, Pipeline, SkipReason},
        ranker::SimilarityRanker,
        store::EmbeddingStore,
    },
    error::{AppError, Result, ResultExt},
    models::{
        embedding::{EmbeddingRecord, FeatureVector},
        results::{ClassificationResults, ImageClassification, LabelScore, NeighborResult, SimilarityResponse},
    },
    state::{AppState, Config, ModelConfig, PipelineConfig},
    utils::{identifier_from_filename, secure_filename},
};

#[cfg(feature = "web")]
pub use crate::api::{create_router, health_check};

#[cfg(feature = "embeddings")]
pub use crate::core::embeddings::TchModel;

/// Initialize logging
///
/// Installs `env_logger` reading `RUST_LOG`, defaulting to `info`. It should
/// be called early in the application startup process.
///
/// # Errors
///
/// Returns an error if a global logger is already installed.
pub fn init() -> Result<()> {
    let env = env_logger::Env::default()
        .default_filter_or("info")
        .default_write_style_or("auto");

    env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .format_module_path(false)
        .format_target(false)
        .try_init()
        .map_err(|e| AppError::Config(format!("logger already initialized: {}", e)))?;

    log::info!(
        "Initializing imagenn {} ({})",
        built_info::PKG_VERSION,
        built_info::TARGET
    );
    Ok(())
}

/// Face detector selected by the configuration
pub fn face_detector(config: &ModelConfig) -> Result<Arc<dyn FaceDetector>> {
    match config.face_detector_cmd.as_deref() {
        Some(command) => {
            log::info!("Counting faces with `{}`", command);
            Ok(Arc::new(CommandFaceDetector::from_command_line(command)?))
        }
        None => {
            log::warn!("No face detector configured, face counts will be 0");
            Ok(Arc::new(NullFaceDetector))
        }
    }
}

/// Provision the model, load it and wire the full pipeline
///
/// # Errors
///
/// Returns an error if the model files cannot be provisioned or loaded, or
/// if the data directories cannot be created.
#[cfg(feature = "embeddings")]
pub async fn build_pipeline(config: &Config) -> Result<Pipeline> {
    core::fetch::ensure_model_files(&config.model).await?;

    let model_config = config.model.clone();
    let model = tokio::task::spawn_blocking(move || TchModel::load(&model_config)).await??;
    let model = Arc::new(model);

    Pipeline::new(config, model.clone(), model, face_detector(&config.model)?)
}
