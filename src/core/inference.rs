//! Contracts of the external models the pipeline drives.
//!
//! All calls are blocking; the orchestrator moves them onto the blocking
//! thread pool.

use std::path::Path;
use std::process::Command;

use crate::error::{AppError, Result};
use crate::models::embedding::FeatureVector;
use crate::models::results::LabelScore;

/// Produces the penultimate-layer embedding of an encoded image.
pub trait FeatureExtractor: Send + Sync {
    /// Fails with [`AppError::Extraction`] on undecodable input.
    fn extract(&self, image: &[u8]) -> Result<FeatureVector>;
}

/// Predicts the most likely labels of an encoded image.
pub trait Classifier: Send + Sync {
    /// The `top_k` labels in descending score order, or [`AppError::Classification`].
    fn classify(&self, image: &[u8], top_k: usize) -> Result<Vec<LabelScore>>;
}

/// Counts faces in an image file.
pub trait FaceDetector: Send + Sync {
    /// Number of faces found in the image at `image_path`.
    fn detect(&self, image_path: &Path) -> Result<usize>;
}

/// Detector used when no face counting program is configured. Reports zero.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullFaceDetector;

impl FaceDetector for NullFaceDetector {
    fn detect(&self, image_path: &Path) -> Result<usize> {
        log::trace!("Face detection disabled, skipping {}", image_path.display());
        Ok(0)
    }
}

/// Runs an external program with the image path appended to its arguments
/// and reads the face count from the first token of its standard output.
#[derive(Debug, Clone)]
pub struct CommandFaceDetector {
    program: String,
    args: Vec<String>,
}

impl CommandFaceDetector {
    /// Parse a whitespace separated command line such as `facecount --scale 1.1`.
    pub fn from_command_line(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace().map(String::from);
        let program = parts
            .next()
            .ok_or_else(|| AppError::Config("face detector command is empty".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl FaceDetector for CommandFaceDetector {
    fn detect(&self, image_path: &Path) -> Result<usize> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(image_path)
            .output()
            .map_err(|e| AppError::Detection(format!("failed to run {}: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(AppError::Detection(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .split_whitespace()
            .next()
            .and_then(|token| token.parse().ok())
            .ok_or_else(|| {
                AppError::Detection(format!("{} printed no face count: {:?}", self.program, stdout))
            })
    }
}
