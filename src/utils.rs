//! Utility functions and helpers for the imagenn service

use std::io::Write;
use std::path::Path;

use anyhow::Result;

/// Ensure a directory exists, creating it if necessary
pub(crate) fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Validate that a file has an allowed extension
pub(crate) fn validate_file_extension<S: AsRef<str>>(filename: &str, allowed_extensions: &[S]) -> bool {
    match filename.rsplit_once('.') {
        Some((_, ext)) => allowed_extensions
            .iter()
            .any(|e| e.as_ref().eq_ignore_ascii_case(ext)),
        None => false,
    }
}

/// Reduce a client supplied filename to a safe flat name.
///
/// Non-ASCII characters are dropped, path separators and whitespace runs
/// become `_`, anything outside `[A-Za-z0-9._-]` is removed and leading or
/// trailing `.`/`_` are trimmed. May return an empty string.
pub fn secure_filename(filename: &str) -> String {
    let ascii: String = filename
        .chars()
        .filter(char::is_ascii)
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();

    let joined = ascii.split_whitespace().collect::<Vec<_>>().join("_");
    let kept: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();

    kept.trim_matches(|c| c == '.' || c == '_').to_string()
}

/// Image identifier for a sanitized filename: everything before the first `.`.
pub fn identifier_from_filename(filename: &str) -> &str {
    filename.split('.').next().unwrap_or(filename)
}

/// Replace `path` wholesale with `contents`.
///
/// The data goes to a temporary file in the same directory that is then
/// renamed over the target, so readers observe either the old or the new
/// file and never a partial one.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    ensure_dir_exists(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
