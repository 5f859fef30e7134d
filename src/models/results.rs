use serde::{Deserialize, Serialize};

/// A single ranked neighbor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborResult {
    /// Identifier of the neighboring image.
    pub filename: String,
    /// Exact cosine similarity, truncated to 4 decimal places.
    pub similarity: f64,
}

/// One predicted label with its softmax score.
///
/// The score is carried as a string and the label key is `labels` on the
/// wire; existing consumers depend on both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelScore {
    /// Human readable class name.
    #[serde(rename = "labels")]
    pub label: String,
    /// Score rendered like a Python float: shortest round-trip digits,
    /// scientific below `1e-4` or from `1e16` up.
    pub score: String,
}

impl LabelScore {
    /// Builds a label entry from a raw probability.
    pub fn new(label: impl Into<String>, score: f32) -> Self {
        Self {
            label: label.into(),
            score: format_score(score),
        }
    }
}

fn format_score(score: f32) -> String {
    if score.is_nan() {
        return "nan".to_string();
    }
    if score.is_infinite() {
        return if score > 0.0 { "inf" } else { "-inf" }.to_string();
    }

    let magnitude = score.abs();
    if magnitude != 0.0 && !(1e-4..1e16).contains(&magnitude) {
        let formatted = format!("{:e}", score);
        let (mantissa, exponent) = formatted.split_once('e').unwrap_or((formatted.as_str(), "0"));
        let (sign, digits) = match exponent.strip_prefix('-') {
            Some(digits) => ('-', digits),
            None => ('+', exponent),
        };
        return format!("{}e{}{:0>2}", mantissa, sign, digits);
    }

    let formatted = score.to_string();
    if formatted.contains('.') {
        formatted
    } else {
        format!("{}.0", formatted)
    }
}

/// Everything learned about one successfully processed image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageClassification {
    /// Identifier of the image.
    pub identifier: String,
    /// Top-k labels in descending score order.
    pub labels: Vec<LabelScore>,
    /// Number of faces reported by the auxiliary detector.
    pub face_count: usize,
}

/// Batch classification output in its compatibility shape.
///
/// Labels of every image are flattened into one list and face counts go in
/// a second list, one entry per image. Both keys are omitted when the batch
/// produced nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResults {
    /// Flattened label groups, `top_k` entries per processed image.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_labels: Vec<LabelScore>,
    /// One face count per processed image.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub number_of_faces: Vec<usize>,
}

impl ClassificationResults {
    /// Converts per-image records to the parallel-list shape, keeping order.
    pub fn from_images<'a, I>(images: I) -> Self
    where
        I: IntoIterator<Item = &'a ImageClassification>,
    {
        let mut results = Self::default();
        for image in images {
            results.image_labels.extend(image.labels.iter().cloned());
            results.number_of_faces.push(image.face_count);
        }
        results
    }

    /// Number of images represented.
    pub fn image_count(&self) -> usize {
        self.number_of_faces.len()
    }

    /// Whether no image contributed to these results.
    pub fn is_empty(&self) -> bool {
        self.number_of_faces.is_empty() && self.image_labels.is_empty()
    }
}

/// The `/api` response body: `[neighbor_list, classification_results]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityResponse(pub Vec<NeighborResult>, pub ClassificationResults);

impl SimilarityResponse {
    /// The ranked neighbors.
    pub fn neighbors(&self) -> &[NeighborResult] {
        &self.0
    }

    /// The classification results.
    pub fn classification(&self) -> &ClassificationResults {
        &self.1
    }
}
