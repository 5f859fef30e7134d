use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::core::ann::{DEFAULT_EF_CONSTRUCTION, DEFAULT_EF_SEARCH};
use crate::core::pipeline::Pipeline;
use crate::error::{AppError, Result};
use crate::models::embedding::DEFAULT_DIMS;

/// Prefix of every environment variable read by [`Config::from_env`].
pub const ENV_PREFIX: &str = "IMAGENN_";

/// Configuration for the application
#[derive(Clone, Debug)]
pub struct Config {
    /// Interface to bind
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Root of the embedding store, neighbor cache and label file
    pub data_dir: PathBuf,
    /// Base directory for request-scoped uploads
    pub upload_dir: PathBuf,
    /// Maximum request body size in bytes
    pub max_upload_size: usize,
    /// Allowed file extensions for uploads
    pub allowed_extensions: Vec<String>,
    /// Retrieval pipeline configuration
    pub pipeline: PipelineConfig,
    /// Inference model configuration
    pub model: ModelConfig,
}

/// Knobs of the per-request orchestration
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Expected feature vector length
    pub dims: usize,
    /// Neighbors returned per query
    pub n_nearest_neighbors: usize,
    /// HNSW candidate list size while building the index
    pub ef_construction: usize,
    /// HNSW candidate list size while querying the index
    pub ef_search: usize,
    /// Labels kept per image
    pub num_top_predictions: usize,
    /// Deadline for each extraction / classification / detection call
    pub timeout: Duration,
    /// Extra attempts after a failed extraction or classification
    pub extraction_retries: u32,
    /// Concurrent blocking model calls
    pub workers: usize,
    /// Keep the vector and neighbor files after the response is assembled
    pub retain_artifacts: bool,
}

/// Location and provisioning of the inference model
#[derive(Clone, Debug)]
pub struct ModelConfig {
    /// Directory holding the model and its label map
    pub model_dir: PathBuf,
    /// TorchScript module file name inside `model_dir`
    pub model_file: String,
    /// Label map file name inside `model_dir`, one label per line
    pub labels_file: String,
    /// Where to fetch the model from when it is missing
    pub model_url: Option<String>,
    /// Where to fetch the label map from when it is missing
    pub labels_url: Option<String>,
    /// Expected SHA3-256 of the model file, hex encoded
    pub model_sha3: Option<String>,
    /// Square input resolution fed to the network
    pub input_size: u32,
    /// External face counting program, invoked with the image path
    pub face_detector_cmd: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: String::from("0.0.0.0"),
            port: 5000,
            data_dir: PathBuf::from("static"),
            upload_dir: PathBuf::from("uploads"),
            max_upload_size: 16 * 1024 * 1024, // 16MB
            allowed_extensions: vec!["png", "jpg", "jpeg"]
                .into_iter()
                .map(String::from)
                .collect(),
            pipeline: PipelineConfig::default(),
            model: ModelConfig::default(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dims: DEFAULT_DIMS,
            n_nearest_neighbors: 30,
            ef_construction: DEFAULT_EF_CONSTRUCTION,
            ef_search: DEFAULT_EF_SEARCH,
            num_top_predictions: 5,
            timeout: Duration::from_secs(30),
            extraction_retries: 0,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            retain_artifacts: false,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_dir: std::env::temp_dir().join("imagenet"),
            model_file: String::from("classify_image.pt"),
            labels_file: String::from("labels.txt"),
            model_url: None,
            labels_url: None,
            model_sha3: None,
            input_size: 299,
            face_detector_cmd: None,
        }
    }
}

impl ModelConfig {
    /// Full path of the TorchScript module
    pub fn model_path(&self) -> PathBuf {
        self.model_dir.join(&self.model_file)
    }

    /// Full path of the label map
    pub fn labels_path(&self) -> PathBuf {
        self.model_dir.join(&self.labels_file)
    }
}

impl Config {
    /// Build a configuration from defaults, a `.env` file and `IMAGENN_*` variables
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenv::dotenv() {
            log::debug!("Loaded environment from {}", path.display());
        }

        let defaults = Self::default();
        let pipeline = PipelineConfig {
            dims: env_or("DIMS", defaults.pipeline.dims)?,
            n_nearest_neighbors: env_or("NEIGHBORS", defaults.pipeline.n_nearest_neighbors)?,
            ef_construction: env_or("EF_CONSTRUCTION", defaults.pipeline.ef_construction)?,
            ef_search: env_or("EF_SEARCH", defaults.pipeline.ef_search)?,
            num_top_predictions: env_or("TOP_PREDICTIONS", defaults.pipeline.num_top_predictions)?,
            timeout: Duration::from_secs(env_or("TIMEOUT_SECS", defaults.pipeline.timeout.as_secs())?),
            extraction_retries: env_or("EXTRACTION_RETRIES", defaults.pipeline.extraction_retries)?,
            workers: env_or("WORKERS", defaults.pipeline.workers)?,
            retain_artifacts: env_or("RETAIN_ARTIFACTS", defaults.pipeline.retain_artifacts)?,
        };
        let model = ModelConfig {
            model_dir: env_or("MODEL_DIR", defaults.model.model_dir)?,
            model_url: env_opt("MODEL_URL"),
            labels_url: env_opt("LABELS_URL"),
            model_sha3: env_opt("MODEL_SHA3"),
            face_detector_cmd: env_opt("FACE_DETECTOR_CMD"),
            ..defaults.model
        };

        let config = Self {
            host: env_or("HOST", defaults.host)?,
            port: env_or("PORT", defaults.port)?,
            data_dir: env_or("DATA_DIR", defaults.data_dir)?,
            upload_dir: env_or("UPLOAD_DIR", defaults.upload_dir)?,
            max_upload_size: env_or("MAX_UPLOAD_BYTES", defaults.max_upload_size)?,
            allowed_extensions: defaults.allowed_extensions,
            pipeline,
            model,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let p = &self.pipeline;
        if p.dims == 0 {
            return Err(AppError::Config("dims must be positive".to_string()));
        }
        if p.n_nearest_neighbors == 0 {
            return Err(AppError::Config("neighbors must be positive".to_string()));
        }
        if p.ef_construction == 0 || p.ef_search == 0 {
            return Err(AppError::Config("ef_construction and ef_search must be positive".to_string()));
        }
        if p.workers == 0 {
            return Err(AppError::Config("workers must be positive".to_string()));
        }
        Ok(())
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, key))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_opt(key) {
        Some(raw) => raw.trim().parse().map_err(|e| {
            AppError::Config(format!("{}{}={:?}: {}", ENV_PREFIX, key, raw, e))
        }),
        None => Ok(default),
    }
}

/// Application state that can be shared across handlers
#[derive(Clone, Debug)]
pub struct AppState {
    /// Application configuration
    pub config: Config,
    /// The retrieval pipeline serving `/api`
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    /// Wrap a configured pipeline for the router
    pub fn new(config: Config, pipeline: Pipeline) -> Arc<Self> {
        Arc::new(Self {
            config,
            pipeline: Arc::new(pipeline),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in ["PORT", "EF_CONSTRUCTION", "EF_SEARCH", "NEIGHBORS", "RETAIN_ARTIFACTS", "MODEL_URL", "DATA_DIR"] {
            std::env::remove_var(format!("{}{}", ENV_PREFIX, key));
        }
    }

    #[test]
    fn test_defaults_match_reference_service() {
        let config = Config::default();
        assert_eq!(config.port, 5000);
        assert_eq!(config.pipeline.n_nearest_neighbors, 30);
        assert_eq!(config.pipeline.ef_construction, 400);
        assert_eq!(config.pipeline.ef_search, 128);
        assert_eq!(config.pipeline.dims, 2048);
        assert_eq!(config.pipeline.num_top_predictions, 5);
        assert!(!config.pipeline.retain_artifacts);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        std::env::set_var("IMAGENN_PORT", "8080");
        std::env::set_var("IMAGENN_EF_SEARCH", "50");
        std::env::set_var("IMAGENN_RETAIN_ARTIFACTS", "true");
        std::env::set_var("IMAGENN_MODEL_URL", "http://localhost/model.pt");

        let config = Config::from_env().unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.pipeline.ef_search, 50);
        assert!(config.pipeline.retain_artifacts);
        assert_eq!(config.model.model_url.as_deref(), Some("http://localhost/model.pt"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_garbage() {
        clear_env();
        std::env::set_var("IMAGENN_NEIGHBORS", "thirty");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, AppError::Config(_)));

        std::env::set_var("IMAGENN_NEIGHBORS", "0");
        assert!(Config::from_env().is_err());
        clear_env();
    }
}
