//! Source URL checks and destination path rules for the client

use crate::protocol::ARCHIVE_SUFFIX;
use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

/// Last path segment of an archive URL, e.g. `image-1234.tgz`.
pub fn archive_name(url: &str) -> Result<&str> {
    let trimmed = url.trim();
    let without_query = trimmed.split(['?', '#']).next().unwrap_or(trimmed);
    if !without_query.ends_with(ARCHIVE_SUFFIX) {
        bail!("<src> argument requires {} suffix: {}", ARCHIVE_SUFFIX, url);
    }
    let lower = without_query.to_ascii_lowercase();
    if !(lower.starts_with("http://") || lower.starts_with("https://")) {
        bail!("<src> must be an http(s) URL: {}", url);
    }
    let name = without_query.rsplit('/').next().unwrap_or(without_query);
    if name == ARCHIVE_SUFFIX || name.is_empty() {
        bail!("<src> has no archive name: {}", url);
    }
    Ok(name)
}

/// Where the rebuilt archive is written.
///
/// - `dst` ending in `/`, or an existing directory: `dst/<archive name>`
/// - `dst` ending in `.tgz`: `dst` itself
/// - anything else is treated as a directory
pub fn resolve_destination(src_url: &str, dst: &Path) -> Result<PathBuf> {
    let name = archive_name(src_url)?;
    let dst_str = dst.to_string_lossy();
    if dst_str.ends_with('/') || dst.is_dir() {
        return Ok(dst.join(name));
    }
    if dst_str.ends_with(ARCHIVE_SUFFIX) {
        return Ok(dst.to_path_buf());
    }
    Ok(dst.join(name))
}
