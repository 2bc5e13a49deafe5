//! Mapping archive and request names onto the local filesystem.

use anyhow::{anyhow, bail, Result};
use std::path::{Component, Path, PathBuf};

/// Normalize a request path to be safely under a root directory.
/// This prevents path traversal attacks by:
/// 1. Rejecting parent directory components
/// 2. Rejecting NUL bytes in path
/// 3. On Windows, rejecting ':' in path components (ADS defense)
/// 4. Canonicalizing the final path to resolve symlinks
/// 5. Ensuring the result is under the root
///
/// Leading `/` is stripped since request paths always carry one. `root` must
/// already be canonical.
pub fn normalize_under_root(root: &Path, p: &Path) -> Result<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    let path_str = p.to_string_lossy();
    if path_str.contains('\0') {
        bail!("path contains NUL byte");
    }

    let mut safe = PathBuf::new();
    for component in p.components() {
        match component {
            CurDir | RootDir => {}
            Normal(s) => {
                #[cfg(windows)]
                if s.to_string_lossy().contains(':') {
                    bail!("path component contains colon (potential ADS attack)");
                }
                safe.push(s);
            }
            ParentDir | Prefix(_) => {
                bail!("path contains disallowed component: {:?}", component);
            }
        }
    }
    if safe.as_os_str().is_empty() {
        bail!("empty archive name");
    }

    let joined = root.join(&safe);

    // Existing archives are canonicalized so symlinks cannot leave the root;
    // a missing one is reported as not found by the caller
    let final_path = if joined.exists() {
        joined
            .canonicalize()
            .map_err(|e| anyhow!("failed to canonicalize {:?}: {}", joined, e))?
    } else {
        joined
    };

    if !final_path.starts_with(root) {
        bail!("path {:?} escapes root {:?}", p, root);
    }

    Ok(final_path)
}

/// Local path where the reference tree would hold archive entry `name`.
///
/// Archive names are commonly `./usr/bin/x` or `/usr/bin/x`; both map to
/// `<reference>/usr/bin/x`. Names with `..` never resolve.
pub fn reference_candidate(reference: &Path, name: &Path) -> Option<PathBuf> {
    let mut candidate = reference.to_path_buf();
    let mut pushed = false;
    for component in name.components() {
        match component {
            Component::Normal(s) => {
                candidate.push(s);
                pushed = true;
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => return None,
        }
    }
    pushed.then_some(candidate)
}

/// Create parent directory if needed
pub fn ensure_parent_exists(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
