use axum::{
    extract::{multipart::MultipartRejection, Multipart, OriginalUri, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
};
use std::sync::Arc;

use crate::{
    core::pipeline::ImageUpload,
    error::{AppError, Result},
    state::Config,
    utils::{secure_filename, validate_file_extension},
    AppState,
};

const UPLOAD_FORM: &str = r#"<!doctype html>
<html>
  <head><title>Find similar images</title></head>
  <body>
    <form action="/api" method="post" enctype="multipart/form-data">
      <input type="file" name="file" accept=".png,.jpg,.jpeg">
      <input type="submit" value="Upload">
    </form>
  </body>
</html>
"#;

pub(crate) async fn hello() -> &'static str {
    "Hello World!"
}

pub(crate) async fn upload_form() -> Html<&'static str> {
    Html(UPLOAD_FORM)
}

/// `POST /api`: rank the uploaded image against the store.
///
/// A missing, unnamed or disallowed upload is answered with a redirect back
/// to the request URL and no body.
pub(crate) async fn classify_upload(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Response> {
    let upload = match multipart {
        Ok(multipart) => read_upload(&state.config, multipart).await,
        Err(rejection) => Err(AppError::UploadError(rejection.body_text())),
    };

    match upload {
        Ok(upload) => Ok(state.pipeline.process(upload).await?.into_response()),
        Err(AppError::UploadError(reason)) => {
            log::warn!("Rejected upload: {}", reason);
            Ok((StatusCode::FOUND, [(header::LOCATION, uri.path().to_string())]).into_response())
        }
        Err(e) => Err(e),
    }
}

async fn read_upload(config: &Config, mut multipart: Multipart) -> Result<ImageUpload> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }

        let client_name = field.file_name().unwrap_or("").to_string();
        if client_name.is_empty() {
            return Err(AppError::UploadError("No selected file".to_string()));
        }
        if !validate_file_extension(&client_name, &config.allowed_extensions) {
            return Err(AppError::UploadError(format!(
                "Unsupported file type: {}",
                client_name
            )));
        }

        let filename = secure_filename(&client_name);
        if filename.is_empty() || !validate_file_extension(&filename, &config.allowed_extensions) {
            return Err(AppError::UploadError(format!(
                "Unusable file name: {}",
                client_name
            )));
        }

        let content = field.bytes().await?;
        log::debug!("Received {} ({} bytes)", filename, content.len());
        return Ok(ImageUpload::new(filename, content));
    }

    Err(AppError::UploadError("No file part".to_string()))
}
