use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::built_info;
use crate::models::results::SimilarityResponse;

/// Body of `GET /api/health`
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `OK` while the process serves requests
    pub status: &'static str,
    /// Crate version the binary was built from
    pub version: &'static str,
}

impl HealthResponse {
    pub(crate) fn current() -> Self {
        Self {
            status: "OK",
            version: built_info::PKG_VERSION,
        }
    }
}

// `[neighbor_list, classification_results]` as a bare JSON array
impl IntoResponse for SimilarityResponse {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}
