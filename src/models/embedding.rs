use serde::{Deserialize, Serialize};

/// Dimensionality of the penultimate-layer features produced by the default model.
pub const DEFAULT_DIMS: usize = 2048;

/// A fixed-length feature vector for exactly one image.
pub type FeatureVector = Vec<f32>;

/// One stored embedding, keyed by the image identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    /// Sanitized base filename with the extension stripped.
    pub identifier: String,
    /// The feature vector. Never mutated after it is written.
    pub vector: FeatureVector,
}

impl EmbeddingRecord {
    /// Creates a new record.
    pub fn new(identifier: impl Into<String>, vector: FeatureVector) -> Self {
        Self {
            identifier: identifier.into(),
            vector,
        }
    }

    /// Number of components in the vector.
    pub fn dims(&self) -> usize {
        self.vector.len()
    }
}
