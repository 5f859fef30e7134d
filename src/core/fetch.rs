use std::io::Write;
use std::path::Path;

use crate::error::{AppError, Result};
use crate::state::ModelConfig;
use crate::utils::ensure_dir_exists;

#[cfg(feature = "hashing")]
use sha3::{Digest, Sha3_256};

/// Make sure the model and label map exist in `config.model_dir`.
///
/// Missing files are downloaded from their configured URL. A missing file
/// without a URL is a configuration error. When a checksum is configured the
/// model file is verified after provisioning.
pub async fn ensure_model_files(config: &ModelConfig) -> Result<()> {
    ensure_dir_exists(&config.model_dir)?;

    fetch_if_missing(&config.model_path(), config.model_url.as_deref()).await?;
    fetch_if_missing(&config.labels_path(), config.labels_url.as_deref()).await?;

    if let Some(expected) = &config.model_sha3 {
        verify_checksum(&config.model_path(), expected)?;
    }
    Ok(())
}

async fn fetch_if_missing(path: &Path, url: Option<&str>) -> Result<()> {
    if tokio::fs::try_exists(path).await? {
        log::debug!("Found {}", path.display());
        return Ok(());
    }
    let url = url.ok_or_else(|| {
        AppError::Config(format!("{} is missing and no download URL is set", path.display()))
    })?;

    log::info!("Downloading {} to {}", url, path.display());
    let response = reqwest::get(url).await?.error_for_status()?;
    let body = response.bytes().await?;

    let target = path.to_path_buf();
    let size = body.len();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let dir = target.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&body)?;
        tmp.persist(&target).map_err(|e| AppError::Io(e.error))?;
        Ok(())
    })
    .await??;

    log::info!("Successfully downloaded {} ({} bytes)", path.display(), size);
    Ok(())
}

#[cfg(feature = "hashing")]
/// Computes the hex SHA3-256 digest of a file
pub fn file_sha3_256<P: AsRef<Path>>(path: P) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha3_256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(feature = "hashing")]
fn verify_checksum(path: &Path, expected: &str) -> Result<()> {
    let actual = file_sha3_256(path)?;
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(AppError::Config(format!(
            "checksum mismatch for {}: expected {}, got {}",
            path.display(),
            expected,
            actual
        )));
    }
    log::debug!("Verified checksum of {}", path.display());
    Ok(())
}

#[cfg(not(feature = "hashing"))]
fn verify_checksum(path: &Path, _expected: &str) -> Result<()> {
    log::warn!(
        "Built without the `hashing` feature, not verifying {}",
        path.display()
    );
    Ok(())
}
