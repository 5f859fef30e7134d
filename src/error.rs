#[cfg(feature = "web")]
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Main error type for the application
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// I/O errors (file operations, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decoding errors
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Missing file part, empty filename or disallowed extension
    #[error("Upload error: {0}")]
    UploadError(String),

    /// The feature extractor rejected an image
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// The classifier rejected an image
    #[error("Classification error: {0}")]
    Classification(String),

    /// The auxiliary face detector failed
    #[error("Detection error: {0}")]
    Detection(String),

    /// A collaborator call ran past its deadline
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A ranking query named an identifier absent from the indexed snapshot
    #[error("Identifier not found: {0}")]
    IdentifierNotFound(String),

    /// No cached neighbor list exists for the identifier
    #[error("No cached neighbors for {0}")]
    CacheMiss(String),

    /// An index build was requested over zero records
    #[error("Cannot build an index over an empty corpus")]
    EmptyCorpus,

    /// Vectors of different lengths were mixed in one index or comparison
    #[error("Dimension mismatch for {identifier}: expected {expected}, found {found}")]
    DimensionMismatch {
        /// The record whose vector has the wrong length.
        identifier: String,
        /// The dimensionality the index was built with.
        expected: usize,
        /// The dimensionality actually found.
        found: usize,
    },

    /// A stored feature vector could not be parsed
    #[error("Corrupt vector file {path}: {reason}")]
    CorruptVector {
        /// Path of the unreadable record.
        path: String,
        /// What went wrong while parsing it.
        reason: String,
    },

    /// Internal server errors
    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Standard error response format
#[derive(Serialize)]
#[derive(Debug)]
pub struct ErrorResponse {
    /// Error code (HTTP status code)
    pub code: u16,
    /// Error message
    pub message: String,
    /// Optional error details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl AppError {
    /// Whether this error only affects a single image of a batch.
    ///
    /// Per-image failures are logged and the image is skipped; everything
    /// else aborts the request.
    pub fn is_per_image(&self) -> bool {
        matches!(
            self,
            Self::Extraction(_)
                | Self::Classification(_)
                | Self::Detection(_)
                | Self::Timeout(_)
                | Self::Image(_)
        )
    }

    #[cfg(feature = "web")]
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) | Self::UploadError(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Image(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Convert the error to a JSON response
    pub fn to_json(&self) -> ErrorResponse {
        #[cfg(feature = "web")]
        let code = self.status_code().as_u16();
        #[cfg(not(feature = "web"))]
        let code = 500u16;

        let details = match self {
            Self::DimensionMismatch { identifier, .. } => Some(format!("record: {}", identifier)),
            Self::CorruptVector { path, .. } => Some(format!("file: {}", path)),
            _ => None,
        };

        ErrorResponse {
            code,
            message: self.to_string(),
            details,
        }
    }
}

#[cfg(feature = "web")]
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("Request failed: {}", self);
        }
        let response = self.to_json();

        (status, Json(response)).into_response()
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        AppError::Internal(format!("Task join error: {}", err))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

#[cfg(feature = "web")]
impl From<axum::extract::multipart::MultipartError> for AppError {
    fn from(err: axum::extract::multipart::MultipartError) -> Self {
        AppError::UploadError(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Config(format!("Model download failed: {}", err))
    }
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, AppError>;

/// Extension trait for working with Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context<C>(self, context: C) -> Result<T>
    where
        C: std::fmt::Display + Send + Sync + 'static;

    /// Add context to an error if the result is an error
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: std::fmt::Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context<C>(self, context: C) -> Result<T>
    where
        C: std::fmt::Display + Send + Sync + 'static,
    {
        self.map_err(|e| AppError::Internal(format!("{}: {}", context, e)))
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: std::fmt::Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        self.map_err(|e| {
            let context = f();
            AppError::Internal(format!("{}: {}", context, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_image_classification() {
        assert!(AppError::Extraction("bad jpeg".into()).is_per_image());
        assert!(AppError::Timeout(std::time::Duration::from_secs(1)).is_per_image());
        assert!(!AppError::EmptyCorpus.is_per_image());
        assert!(!AppError::CacheMiss("cat".into()).is_per_image());
    }

    #[test]
    fn test_error_json_details() {
        let err = AppError::DimensionMismatch {
            identifier: "dog".to_string(),
            expected: 2048,
            found: 3,
        };
        let json = err.to_json();
        assert_eq!(json.details.as_deref(), Some("record: dog"));
        assert!(json.message.contains("expected 2048"));
    }

    #[test]
    fn test_context_wraps_message() {
        let res: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        let err = res.context("writing labels").unwrap_err();
        assert_eq!(err.to_string(), "Internal server error: writing labels: boom");
    }
}
